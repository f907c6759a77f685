//! Statistical aggregation of lead-time samples.
//!
//! Everything here is a pure function of the collected samples and a
//! reference `now`, so the aggregator can be tested without any I/O.

use crate::quality::PRQualityIssues;
use crate::stagnation::StagnantPRMetrics;
use crate::types::duration_secs;
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc, Weekday};
use serde::Serialize;
use std::collections::BTreeMap;

const END_OF_DAY_HOUR: u32 = 23;
const END_OF_DAY_MIN: u32 = 59;
const END_OF_DAY_SEC: u32 = 59;

const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// One merged pull request's lead time and review timestamps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeadTimeSample {
    pub number: u64,
    pub created_at: DateTime<Utc>,
    pub merged_at: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub first_review_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
}

impl LeadTimeSample {
    /// Builds a sample, or `None` if the merge predates the creation.
    pub fn new(number: u64, created_at: DateTime<Utc>, merged_at: DateTime<Utc>) -> Option<Self> {
        if merged_at < created_at {
            return None;
        }
        Some(Self {
            number,
            created_at,
            merged_at,
            duration: merged_at - created_at,
            first_review_at: None,
            approved_at: None,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LeadTimeStat {
    #[serde(with = "duration_secs")]
    pub average: Duration,
    #[serde(with = "duration_secs")]
    pub median: Duration,
    pub count: usize,
}

fn to_nanos(d: Duration) -> i128 {
    d.num_seconds() as i128 * 1_000_000_000 + d.subsec_nanos() as i128
}

fn from_nanos(nanos: i128) -> Duration {
    let secs = nanos.div_euclid(1_000_000_000);
    let rem = nanos.rem_euclid(1_000_000_000);
    Duration::seconds(secs as i64) + Duration::nanoseconds(rem as i64)
}

/// Mean of `durations`, or zero when empty.
pub fn average_duration(durations: &[Duration]) -> Duration {
    if durations.is_empty() {
        return Duration::zero();
    }
    let total: i128 = durations.iter().copied().map(to_nanos).sum();
    from_nanos(total / durations.len() as i128)
}

/// Median of `durations`, or zero when empty.
///
/// For an even count the two central values are averaged in nanoseconds.
pub fn median_duration(durations: &[Duration]) -> Duration {
    if durations.is_empty() {
        return Duration::zero();
    }
    let mut sorted = durations.to_vec();
    sorted.sort_unstable();

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        from_nanos((to_nanos(sorted[mid - 1]) + to_nanos(sorted[mid])) / 2)
    }
}

impl LeadTimeStat {
    pub fn from_durations(durations: &[Duration]) -> Self {
        Self {
            average: average_duration(durations),
            median: median_duration(durations),
            count: durations.len(),
        }
    }

    pub fn from_samples(samples: &[LeadTimeSample]) -> Self {
        let durations: Vec<Duration> = samples.iter().map(|s| s.duration).collect();
        Self::from_durations(&durations)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WeekdayActivity {
    pub weekday: Weekday,
    pub merged: usize,
    pub reviewed: usize,
}

/// Merge and first-review counts per weekday, always Monday through Sunday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayOfWeekStats {
    pub days: Vec<WeekdayActivity>,
}

impl Default for DayOfWeekStats {
    fn default() -> Self {
        Self {
            days: WEEKDAYS
                .iter()
                .map(|&weekday| WeekdayActivity {
                    weekday,
                    merged: 0,
                    reviewed: 0,
                })
                .collect(),
        }
    }
}

impl DayOfWeekStats {
    pub fn get(&self, weekday: Weekday) -> &WeekdayActivity {
        &self.days[weekday.num_days_from_monday() as usize]
    }

    fn get_mut(&mut self, weekday: Weekday) -> &mut WeekdayActivity {
        &mut self.days[weekday.num_days_from_monday() as usize]
    }
}

pub fn aggregate_by_day_of_week(samples: &[LeadTimeSample]) -> DayOfWeekStats {
    let mut stats = DayOfWeekStats::default();
    for sample in samples {
        stats.get_mut(sample.merged_at.weekday()).merged += 1;
        if let Some(first_review) = sample.first_review_at {
            stats.get_mut(first_review.weekday()).reviewed += 1;
        }
    }
    stats
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WeekSummary {
    pub merged: usize,
    #[serde(with = "duration_secs")]
    pub average_lead_time: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WeeklyComparison {
    pub this_week: WeekSummary,
    pub last_week: WeekSummary,
    pub merged_change_percent: f64,
    pub lead_time_change_percent: f64,
}

/// Relative change from `previous` to `current`, in percent.
///
/// A zero baseline yields 0% when nothing happened and 100% otherwise.
pub fn percent_change(previous: f64, current: f64) -> f64 {
    if previous == 0.0 {
        if current == 0.0 {
            0.0
        } else {
            100.0
        }
    } else {
        (current - previous) / previous * 100.0
    }
}

fn summarize_week<'a>(samples: impl Iterator<Item = &'a LeadTimeSample>) -> WeekSummary {
    let durations: Vec<Duration> = samples.map(|s| s.duration).collect();
    WeekSummary {
        merged: durations.len(),
        average_lead_time: average_duration(&durations),
    }
}

/// Compares merges in `[now-7d, now]` against `[now-14d, now-7d)`.
pub fn compare_weeks(samples: &[LeadTimeSample], now: DateTime<Utc>) -> WeeklyComparison {
    let week_start = now - Duration::days(7);
    let last_week_start = now - Duration::days(14);

    let this_week = summarize_week(
        samples
            .iter()
            .filter(|s| s.merged_at >= week_start && s.merged_at <= now),
    );
    let last_week = summarize_week(
        samples
            .iter()
            .filter(|s| s.merged_at >= last_week_start && s.merged_at < week_start),
    );

    WeeklyComparison {
        this_week,
        last_week,
        merged_change_percent: percent_change(last_week.merged as f64, this_week.merged as f64),
        lead_time_change_percent: percent_change(
            last_week.average_lead_time.num_seconds() as f64,
            this_week.average_lead_time.num_seconds() as f64,
        ),
    }
}

/// Mean duration of each review phase over chronologically consistent samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReviewPhaseMetrics {
    #[serde(with = "duration_secs")]
    pub time_to_first_review: Duration,
    #[serde(with = "duration_secs")]
    pub time_to_approval: Duration,
    #[serde(with = "duration_secs")]
    pub time_to_merge: Duration,
    #[serde(with = "duration_secs")]
    pub total_lead_time: Duration,
    pub count: usize,
}

pub fn review_phase_metrics(samples: &[LeadTimeSample]) -> ReviewPhaseMetrics {
    let mut to_review = Vec::new();
    let mut to_approval = Vec::new();
    let mut to_merge = Vec::new();
    let mut total = Vec::new();

    for sample in samples {
        let (Some(first_review), Some(approved)) = (sample.first_review_at, sample.approved_at)
        else {
            continue;
        };
        let consistent = sample.created_at <= first_review
            && first_review <= approved
            && approved <= sample.merged_at;
        if !consistent {
            continue;
        }

        to_review.push(first_review - sample.created_at);
        to_approval.push(approved - first_review);
        to_merge.push(sample.merged_at - approved);
        total.push(sample.duration);
    }

    ReviewPhaseMetrics {
        time_to_first_review: average_duration(&to_review),
        time_to_approval: average_duration(&to_approval),
        time_to_merge: average_duration(&to_merge),
        total_lead_time: average_duration(&total),
        count: total.len(),
    }
}

/// Merges and average lead time for one calendar day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    /// The day (YYYY-MM-DD).
    pub date: String,
    pub merged: usize,
    #[serde(with = "duration_secs")]
    pub average_lead_time: Duration,
}

/// Builds one [`TrendPoint`] per day for the last `days` days, oldest first.
pub fn calculate_trend(samples: &[LeadTimeSample], days: i64, now: DateTime<Utc>) -> Vec<TrendPoint> {
    (0..days.max(0))
        .rev()
        .filter_map(|i| {
            let date = now - Duration::days(i);
            // End of day so the whole calendar day is covered.
            let day_end = Utc
                .with_ymd_and_hms(
                    date.year(),
                    date.month(),
                    date.day(),
                    END_OF_DAY_HOUR,
                    END_OF_DAY_MIN,
                    END_OF_DAY_SEC,
                )
                .single()?;

            Some(calculate_day_point(samples, day_end))
        })
        .collect()
}

fn calculate_day_point(samples: &[LeadTimeSample], day_end: DateTime<Utc>) -> TrendPoint {
    let day_start = day_end - Duration::days(1);
    let durations: Vec<Duration> = samples
        .iter()
        .filter(|s| s.merged_at > day_start && s.merged_at <= day_end)
        .map(|s| s.duration)
        .collect();

    TrendPoint {
        date: day_end.format("%Y-%m-%d").to_string(),
        merged: durations.len(),
        average_lead_time: average_duration(&durations),
    }
}

/// A secondary analyzer failure surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalyzerWarning {
    pub analyzer: &'static str,
    pub message: String,
}

/// The result of one lead-time metrics run.
#[derive(Debug, Clone, Serialize)]
pub struct LeadTimeMetrics {
    pub since: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub overall: LeadTimeStat,
    pub by_repository: BTreeMap<String, LeadTimeStat>,
    pub day_of_week: DayOfWeekStats,
    pub day_of_week_by_repository: BTreeMap<String, DayOfWeekStats>,
    pub weekly: WeeklyComparison,
    pub weekly_by_repository: BTreeMap<String, WeeklyComparison>,
    pub review_phases: ReviewPhaseMetrics,
    pub review_phases_by_repository: BTreeMap<String, ReviewPhaseMetrics>,
    pub trend: Vec<TrendPoint>,
    pub stagnant: Option<StagnantPRMetrics>,
    pub quality_issues: Option<PRQualityIssues>,
    pub warnings: Vec<AnalyzerWarning>,
}

impl LeadTimeMetrics {
    /// Aggregates per-repository samples collected for the window starting at `since`.
    pub fn from_samples(
        samples_by_repo: &BTreeMap<String, Vec<LeadTimeSample>>,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
        trend_days: i64,
    ) -> Self {
        let all: Vec<LeadTimeSample> = samples_by_repo.values().flatten().cloned().collect();

        let mut metrics = Self {
            since,
            generated_at: now,
            overall: LeadTimeStat::from_samples(&all),
            by_repository: BTreeMap::new(),
            day_of_week: aggregate_by_day_of_week(&all),
            day_of_week_by_repository: BTreeMap::new(),
            weekly: compare_weeks(&all, now),
            weekly_by_repository: BTreeMap::new(),
            review_phases: review_phase_metrics(&all),
            review_phases_by_repository: BTreeMap::new(),
            trend: calculate_trend(&all, trend_days, now),
            stagnant: None,
            quality_issues: None,
            warnings: Vec::new(),
        };

        for (repo, samples) in samples_by_repo {
            metrics
                .by_repository
                .insert(repo.clone(), LeadTimeStat::from_samples(samples));
            metrics
                .day_of_week_by_repository
                .insert(repo.clone(), aggregate_by_day_of_week(samples));
            metrics
                .weekly_by_repository
                .insert(repo.clone(), compare_weeks(samples, now));
            metrics
                .review_phases_by_repository
                .insert(repo.clone(), review_phase_metrics(samples));
        }

        metrics
    }

    /// The zero-valued aggregate for a run with no repositories.
    pub fn empty(since: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self::from_samples(&BTreeMap::new(), since, now, 0)
    }
}
