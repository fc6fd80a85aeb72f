//! Task command handlers

use super::App;
use crate::context::RequestContext;
use crate::error::{Result, TiticacaError};
use crate::models::{Task, TaskStatus};
use colored::Colorize;
use tracing::info;

fn colored_status(status: TaskStatus) -> colored::ColoredString {
    match status {
        TaskStatus::Pending => status.as_str().yellow(),
        TaskStatus::Processing => status.as_str().cyan(),
        TaskStatus::Success => status.as_str().green(),
        TaskStatus::Failure => status.as_str().red(),
    }
}

fn print_task(task: &Task) {
    println!("  ID: {}", task.id);
    println!("  Type: {}", task.task_type);
    println!("  Status: {}", colored_status(task.status));
    println!("  Owner: {}", task.owner);
    if let Some(image_id) = &task.image_id {
        println!("  Image: {}", image_id);
    }
    if let Some(expires_at) = task.expires_at {
        println!("  Expires at: {}", expires_at);
    }
    if !task.message.is_empty() {
        println!("  Message: {}", task.message);
    }
    if let Some(result) = &task.result {
        println!("  Result: {}", result);
    }
}

/// Handle task create command
pub async fn handle_create(
    app: &App,
    ctx: &RequestContext,
    task_type: String,
    owner: Option<String>,
    image_id: Option<String>,
    input: String,
) -> Result<()> {
    let input: serde_json::Value = serde_json::from_str(&input)
        .map_err(|e| TiticacaError::BadTaskConfiguration(format!("--input is not JSON: {}", e)))?;
    let owner = owner.unwrap_or_else(|| ctx.owner());

    let mut task = app
        .task_factory()
        .new_task(&task_type, owner, input)?
        .with_request_id(ctx.request_id.clone());
    if let Some(image_id) = image_id {
        task = task.with_image_id(image_id);
    }
    if let Some(user_id) = &ctx.user_id {
        task = task.with_user_id(user_id.clone());
    }

    app.gateway.task_repo(ctx, true).add(&task).await?;
    info!(task_id = %task.id, task_type = %task.task_type, "Task created");

    println!("{}", "✓ Task created successfully".green().bold());
    print_task(&task);
    Ok(())
}

/// Handle task show command
pub async fn handle_show(app: &App, ctx: &RequestContext, id: String) -> Result<()> {
    let task = app.gateway.task_repo(ctx, true).get(&id).await?;
    println!("Task:");
    print_task(&task);
    Ok(())
}

/// Handle task list command
pub async fn handle_list(app: &App, ctx: &RequestContext) -> Result<()> {
    let tasks = app.gateway.task_repo(ctx, true).list().await?;

    if tasks.is_empty() {
        println!("{}", "No tasks found".yellow());
        return Ok(());
    }

    println!("Tasks:");
    println!("{:<38} {:<18} {:<12} {:<38}", "ID", "Type", "Status", "Image");
    println!("{}", "-".repeat(108));
    for task in tasks {
        println!(
            "{:<38} {:<18} {:<12} {:<38}",
            task.id,
            task.task_type,
            colored_status(task.status),
            task.image_id.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

/// Handle task run command
pub async fn handle_run(app: &App, ctx: &RequestContext, id: String) -> Result<()> {
    println!("Running task: {}", id);
    let executor = app.executor(ctx.clone());

    match executor.begin_processing(&id).await {
        Ok(task) => {
            println!("{}", "✓ Task completed".green().bold());
            print_task(&task);
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {}", "✗ Task failed:".red().bold(), e);
            Err(e)
        }
    }
}
