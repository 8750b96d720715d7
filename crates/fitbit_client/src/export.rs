//! Date-window export loop.
//!
//! The get-time-series reply lacks the time, it only contains the date,
//! and it returns one averaged value per day instead of the raw
//! measurements. So the time series is only used to figure out when the
//! first entry was recorded, and the raw data is fetched in 30-day
//! windows from the body-weight log endpoint. The user's registration
//! date cannot stand in for the first entry because data may be
//! backfilled into the account through the API.

use std::io::Write;

use chrono::{Duration, NaiveDate};

use crate::{FitbitApi, FitbitError};

/// Length of one body-weight log window in days.
const WINDOW_DAYS: i64 = 30;

pub struct WeightExporter<C> {
    client: C,
}

impl<C: FitbitApi> WeightExporter<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    /// Export every measurement as a `YYYY-MM-DD HH:MM weight` line and
    /// return the number of lines written.
    ///
    /// `today` bounds the window iteration; it is a parameter so the loop
    /// is testable.
    pub async fn export<W: Write>(&self, out: &mut W, today: NaiveDate) -> Result<u64, FitbitError> {
        let series = self.client.get_weight_timeseries().await?;
        let Some(first) = series.first() else {
            tracing::info!("the fitbit API returned no values");
            return Ok(0);
        };
        let first_date = NaiveDate::parse_from_str(&first.date_time, "%Y-%m-%d").map_err(|e| {
            FitbitError::Decode(format!(
                "could not parse timeseries date value {:?}: {e}",
                first.date_time
            ))
        })?;

        // Rewind one day so the first measurement cannot sit exactly on a
        // window boundary and get skipped.
        let mut end_date = first_date - Duration::days(1);

        let mut lines = 0u64;
        while end_date <= today {
            end_date += Duration::days(WINDOW_DAYS);
            let entries = self.client.get_weight_log(end_date).await?;
            tracing::debug!("window ending {end_date}: {} entries", entries.len());
            for entry in &entries {
                let hhmm = entry.time.get(..5).unwrap_or(&entry.time);
                writeln!(out, "{} {} {:.1}", entry.date, hhmm, entry.weight)?;
                lines += 1;
            }
        }
        Ok(lines)
    }
}
