use clap::Subcommand;
use serde_json::json;

use super::{print_json, App, CommandResult};

#[derive(Subcommand)]
pub enum ChallengeAction {
    /// Show today's challenge, generating it if needed
    Today,
    /// Replace today's challenge with a new one
    Refresh,
    /// Mark today's challenge completed
    Complete,
    /// Add today's challenge to the task list (once)
    Link,
}

pub async fn run(action: ChallengeAction) -> CommandResult {
    let app = App::open()?;
    let engine = app.challenge_engine()?;
    let profile = app.config.profile.clone();

    match action {
        ChallengeAction::Today => {
            let artifact = engine.load_or_generate_today(&profile).await?;
            print_json(&artifact)?;
        }
        ChallengeAction::Refresh => {
            let artifact = engine.refresh(&profile).await?;
            print_json(&artifact)?;
        }
        ChallengeAction::Complete => {
            let artifact = engine.mark_completed(&profile.user_id).await?;
            print_json(&artifact)?;
        }
        ChallengeAction::Link => {
            let db = app.db.clone();
            let user_id = profile.user_id.clone();
            let task_id = engine
                .link_to_task(&profile.user_id, |artifact| async move {
                    let title = format!("{} {}", artifact.emoji, artifact.title);
                    db.create_task(&user_id, title.trim(), Some(&artifact.id))
                })
                .await?;
            print_json(&json!({ "task_id": task_id }))?;
        }
    }
    Ok(())
}

pub fn list_tasks() -> CommandResult {
    let app = App::open()?;
    let tasks = app.db.list_tasks(&app.config.profile.user_id)?;
    print_json(&tasks)
}
