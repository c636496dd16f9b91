use dayring_core::ProgressResult;
use serde_json::json;

use super::{print_json, App, CommandResult};

pub async fn run() -> CommandResult {
    let app = App::open()?;
    let engine = app.progress_engine()?;
    let result = engine.activate(app.config.profile.clone()).await?.into_result()?;
    print_progress(&result)
}

pub fn print_progress(result: &ProgressResult) -> CommandResult {
    print_json(&json!({
        "completed_days": result.completed_days,
        "elapsed_days": result.elapsed_days,
        "target_days": result.target_days,
        "fraction": result.fraction,
        "percent": result.percent(),
    }))
}
