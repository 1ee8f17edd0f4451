use std::time::Duration;

use chrono::{Datelike, Local};
use tracing::{info, warn};

use crate::store::Stores;

/// Zeroes `currentDay` at local midnight and `currentMonth` on the 1st.
/// Admissions never consult the clock; they trust these counters.
pub fn spawn_counter_resets(stores: Stores) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		loop {
			tokio::time::sleep(until_next_midnight()).await;

			match stores.projects.reset_daily().await {
				Ok(n) => info!(projects = n, "reset daily usage counters"),
				Err(e) => warn!(error = %e, "daily counter reset failed"),
			}
			if Local::now().day() == 1 {
				match stores.projects.reset_monthly().await {
					Ok(n) => info!(projects = n, "reset monthly usage counters"),
					Err(e) => warn!(error = %e, "monthly counter reset failed"),
				}
			}
		}
	})
}

fn until_next_midnight() -> Duration {
	let now = Local::now();
	let next = (now + chrono::Duration::days(1))
		.date_naive()
		.and_hms_opt(0, 0, 0)
		.and_then(|naive| naive.and_local_timezone(Local).earliest());
	match next {
		Some(next) => (next - now).to_std().unwrap_or(Duration::from_secs(60)),
		// DST gap right at midnight; try again shortly.
		None => Duration::from_secs(60),
	}
}
