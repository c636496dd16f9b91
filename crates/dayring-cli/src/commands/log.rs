use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use dayring_core::{Clock, CompletionRecord, CompletionStore, DayKey, Event, EventBus, SystemClock};
use tracing::debug;

use super::progress::print_progress;
use super::{App, CommandResult};

#[derive(Args)]
pub struct LogArgs {
    /// Day to record (YYYY-MM-DD, default today)
    #[arg(long)]
    pub date: Option<DayKey>,
    /// Record the day as not completed
    #[arg(long)]
    pub undo: bool,
}

pub async fn run(args: LogArgs) -> CommandResult {
    let app = App::open()?;
    let user_id = app.config.profile.user_id.clone();
    let day_key = args.date.unwrap_or_else(|| SystemClock.today());

    let engine = Arc::new(app.progress_engine()?);
    engine.activate(app.config.profile.clone()).await?;

    let bus = EventBus::with_capacity(app.config.events.channel_capacity);
    let listener = engine.spawn_listener(&bus);
    let mut published = engine.subscribe();

    app.db
        .record(CompletionRecord::new(user_id.clone(), day_key, !args.undo))
        .await?;
    bus.emit(Event::DayCompletionChanged { user_id, day_key });

    // the listener recomputes in the background; fall back to a direct
    // recompute if it doesn't publish
    let result = match tokio::time::timeout(Duration::from_secs(5), published.changed()).await {
        Ok(Ok(())) => engine.latest(),
        _ => {
            debug!("no recompute from listener, recomputing directly");
            engine.recompute().await?.into_result().ok()
        }
    };
    listener.abort();

    match result {
        Some(result) => print_progress(&result),
        None => Err("progress unavailable".into()),
    }
}
