//! Time-bucketed metrics: period arithmetic and the granular metric step.
//!
//! A metric file is instantiated across all four granularities. Only closed
//! periods are emitted, with a half-open `[first_period, last_period)`
//! window, and a period is never recomputed once its watermark advances.

use anyhow::Result;
use time::macros::format_description;
use time::{Date, Duration, Month, OffsetDateTime, PrimitiveDateTime, Time};

use crate::indexer::runner::IndexRunner;
use crate::indexer::sqlfile::{execute_statements, load_sql, substitute};
use crate::indexer::watermarks::{save_watermark, watermark_key};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Hour,
    Day,
    Week,
    Month,
}

impl Granularity {
    pub const ALL: [Granularity; 4] = [
        Granularity::Hour,
        Granularity::Day,
        Granularity::Week,
        Granularity::Month,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
        }
    }

    /// The ClickHouse bucketing function this granularity renders to.
    pub fn sql_function(&self) -> &'static str {
        match self {
            Granularity::Hour => "toStartOfHour",
            Granularity::Day => "toStartOfDay",
            Granularity::Week => "toStartOfWeek",
            Granularity::Month => "toStartOfMonth",
        }
    }
}

fn midnight(date: Date) -> OffsetDateTime {
    PrimitiveDateTime::new(date, Time::MIDNIGHT).assume_utc()
}

/// Start of the period containing `t`, in UTC. Weeks start on Sunday to
/// match ClickHouse's default toStartOfWeek mode.
pub fn truncate(t: OffsetDateTime, granularity: Granularity) -> OffsetDateTime {
    let t = t.to_offset(time::UtcOffset::UTC);
    let date = t.date();

    match granularity {
        Granularity::Hour => {
            let hour = Time::from_hms(t.hour(), 0, 0).expect("hour is within range");
            PrimitiveDateTime::new(date, hour).assume_utc()
        }
        Granularity::Day => midnight(date),
        Granularity::Week => {
            let days_into_week = date.weekday().number_days_from_sunday();
            midnight(date - Duration::days(days_into_week as i64))
        }
        Granularity::Month => {
            let first =
                Date::from_calendar_date(date.year(), date.month(), 1).expect("day 1 exists");
            midnight(first)
        }
    }
}

/// Start of the period after the one containing `t`.
pub fn next_period(t: OffsetDateTime, granularity: Granularity) -> OffsetDateTime {
    let start = truncate(t, granularity);
    match granularity {
        Granularity::Hour => start + Duration::hours(1),
        Granularity::Day => start + Duration::days(1),
        Granularity::Week => start + Duration::days(7),
        Granularity::Month => {
            let date = start.date();
            let (year, month) = match date.month() {
                Month::December => (date.year() + 1, Month::January),
                month => (date.year(), month.next()),
            };
            midnight(Date::from_calendar_date(year, month, 1).expect("day 1 exists"))
        }
    }
}

/// The ordered period starts to emit: everything after `last_period` whose
/// period has fully closed at `now`. Empty when nothing has closed yet.
pub fn periods_to_process(
    last_period: OffsetDateTime,
    now: OffsetDateTime,
    granularity: Granularity,
) -> Vec<OffsetDateTime> {
    let mut periods = Vec::new();
    let mut period = next_period(last_period, granularity);

    while next_period(period, granularity) <= now {
        periods.push(period);
        period = next_period(period, granularity);
    }

    periods
}

/// Renders a period start the way the metric SQL splices it.
pub fn format_ch_datetime(t: OffsetDateTime) -> Result<String> {
    let description = format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
    );
    Ok(t.format(&description)?)
}

impl IndexRunner {
    pub(super) async fn process_granular_metrics(&mut self) {
        for metric in self.granular_metrics.clone() {
            for granularity in Granularity::ALL {
                let indexer_name = format!("{}/{metric}", self.metrics_variant);
                let key = watermark_key(&indexer_name, granularity.as_str());
                let watermark = self.watermarks.entry(key.clone()).or_default();
                let last_period = watermark.last_period;

                let periods =
                    periods_to_process(last_period, self.latest_block_time, granularity);
                if periods.is_empty() {
                    continue;
                }

                log::info!(
                    "[chain {}] running {indexer_name} ({}) - {} periods",
                    self.chain_id,
                    granularity.as_str(),
                    periods.len()
                );

                if let Err(err) = self
                    .run_granular_metric(&metric, granularity, &periods)
                    .await
                {
                    panic!(
                        "[chain {}] fatal: failed to run {indexer_name} ({}): {err:#}",
                        self.chain_id,
                        granularity.as_str()
                    );
                }

                // A period is never emitted twice: advance before the next
                // poll can see it.
                let mut updated = *self.watermarks.get(&key).expect("inserted above");
                updated.last_period = *periods.last().expect("periods is non-empty");
                self.watermarks.insert(key, updated);

                if let Err(err) = save_watermark(
                    &self.client,
                    self.chain_id,
                    &indexer_name,
                    granularity.as_str(),
                    &updated,
                )
                .await
                {
                    panic!(
                        "[chain {}] fatal: failed to save watermark for {indexer_name}: {err:#}",
                        self.chain_id
                    );
                }
            }
        }
    }

    async fn run_granular_metric(
        &self,
        metric: &str,
        granularity: Granularity,
        periods: &[OffsetDateTime],
    ) -> Result<()> {
        let first_period = periods[0];
        let last_period = next_period(*periods.last().expect("periods is non-empty"), granularity);

        // Order matters: specific patterns first, then generic.
        let params = vec![
            ("toStartOf{granularity}", granularity.sql_function().to_string()),
            ("_{granularity}", format!("_{}", granularity.as_str())),
            ("{chain_id:UInt32}", self.chain_id.to_string()),
            (
                "{first_period:DateTime}",
                format!("toDateTime64('{}', 3)", format_ch_datetime(first_period)?),
            ),
            (
                "{last_period:DateTime}",
                format!("toDateTime64('{}', 3)", format_ch_datetime(last_period)?),
            ),
            ("{granularity}", granularity.as_str().to_string()),
        ];

        let sql = load_sql(
            &self.sql_root,
            &format!("{}/{metric}.sql", self.metrics_variant),
        )?;
        execute_statements(&self.client, &substitute(&sql, &params)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn truncation_per_granularity() {
        let t = datetime!(2024-01-03 05:42:17.5 UTC);
        assert_eq!(
            truncate(t, Granularity::Hour),
            datetime!(2024-01-03 05:00:00 UTC)
        );
        assert_eq!(
            truncate(t, Granularity::Day),
            datetime!(2024-01-03 00:00:00 UTC)
        );
        // 2024-01-03 is a Wednesday; the Sunday before is 2023-12-31.
        assert_eq!(
            truncate(t, Granularity::Week),
            datetime!(2023-12-31 00:00:00 UTC)
        );
        assert_eq!(
            truncate(t, Granularity::Month),
            datetime!(2024-01-01 00:00:00 UTC)
        );
    }

    #[test]
    fn month_rolls_over_year_end() {
        let t = datetime!(2023-12-15 12:00:00 UTC);
        assert_eq!(
            next_period(t, Granularity::Month),
            datetime!(2024-01-01 00:00:00 UTC)
        );
    }

    #[test]
    fn no_periods_before_the_first_close() {
        // now is inside the period right after the watermark: nothing has
        // closed yet.
        let last = datetime!(2024-01-01 00:00:00 UTC);
        let now = datetime!(2024-01-02 23:59:59 UTC);
        assert!(periods_to_process(last, now, Granularity::Day).is_empty());
    }

    #[test]
    fn only_closed_periods_are_emitted() {
        let last = datetime!(2023-12-31 00:00:00 UTC);
        let now = datetime!(2024-01-03 05:00:00 UTC);

        let periods = periods_to_process(last, now, Granularity::Day);
        assert_eq!(
            periods,
            vec![
                datetime!(2024-01-01 00:00:00 UTC),
                datetime!(2024-01-02 00:00:00 UTC),
            ]
        );
    }

    #[test]
    fn last_emitted_period_satisfies_the_window_law() {
        let last = datetime!(2024-01-01 00:00:00 UTC);
        let now = datetime!(2024-03-20 10:30:00 UTC);

        for granularity in Granularity::ALL {
            let periods = periods_to_process(last, now, granularity);
            let tail = *periods.last().unwrap();
            assert!(next_period(tail, granularity) <= now);
            assert!(next_period(next_period(tail, granularity), granularity) > now);
        }
    }

    #[test]
    fn epoch_watermark_emits_every_closed_period() {
        let now = datetime!(1970-01-05 12:00:00 UTC);
        let periods = periods_to_process(OffsetDateTime::UNIX_EPOCH, now, Granularity::Day);

        // Days 2, 3 and 4 of January 1970 have closed; the 5th has not.
        assert_eq!(periods.len(), 3);
        assert_eq!(periods[0], datetime!(1970-01-02 00:00:00 UTC));
        assert_eq!(periods[2], datetime!(1970-01-04 00:00:00 UTC));
    }

    #[test]
    fn datetime_renders_with_milliseconds() {
        let t = datetime!(2024-01-02 00:00:00 UTC);
        assert_eq!(format_ch_datetime(t).unwrap(), "2024-01-02 00:00:00.000");
    }
}
