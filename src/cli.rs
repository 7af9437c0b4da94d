use chrono::{DateTime, Utc};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "transformer-forecast",
    version,
    about = "Temperature forecasts on event history and the live device stream"
)]
pub struct Args {
    /// Local .csv file with `unix_time` and `temperature` columns; replaces the cloud API.
    #[arg(long)]
    pub path: Option<PathBuf>,
    /// Event history start (UTC, RFC 3339). Without it no history is fetched.
    #[arg(long)]
    pub starttime: Option<DateTime<Utc>>,
    /// Event history end (UTC, RFC 3339). Defaults to now.
    #[arg(long)]
    pub endtime: Option<DateTime<Utc>>,
    /// Stop after the history instead of following the live stream.
    #[arg(long, default_value_t = false)]
    pub no_live: bool,
    /// Emit forecasts while replaying history even when the live stream follows.
    #[arg(long, default_value_t = false)]
    pub emit_backfill: bool,
    /// Also write forecasts to this CSV file.
    #[arg(long)]
    pub forecast_csv: Option<PathBuf>,
    /// Pass every ingested event to the sinks as well.
    #[arg(long, default_value_t = false)]
    pub record_events: bool,
    /// Print this many forecast steps per sensor when the run ends.
    #[arg(long, default_value_t = 0)]
    pub summary_steps: usize,
}

impl Args {
    pub fn local(&self) -> bool {
        self.path.is_some()
    }

    pub fn live(&self) -> bool {
        !self.no_live && !self.local()
    }
}
