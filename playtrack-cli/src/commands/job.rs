use std::collections::HashSet;

use async_trait::async_trait;
use color_eyre::eyre::{Result, WrapErr};
use dialoguer::FuzzySelect;
use playtrack::ipc::RunnerApi;
use playtrack::job::ExtraVars;
use playtrack::log::*;
use playtrack::parse::parse;
use playtrack::render::{render, render_summary, render_text, summary_export};
use playtrack::tracker::{JobChange, SessionSnapshot, SubmitRequest, Tracker};
use regex::Regex;
use serde_json::Value;

use super::{CliContext, Command, CommandErrors, Interactive};

/// Parse `-e key=value` pairs. Values that are valid JSON are sent as such,
/// anything else as a string.
pub(crate) fn parse_extra_vars<'a, I: IntoIterator<Item = &'a String>>(pairs: I) -> Result<ExtraVars> {
    let pattern = Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)=(.*)$")?;
    let mut vars = ExtraVars::new();
    for pair in pairs {
        let caps = pattern.captures(pair).ok_or_else(|| {
            CommandErrors::InputValidationFailure(pair.clone(), pattern.as_str().to_string())
        })?;
        let raw = &caps[2];
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        vars.insert(caps[1].to_string(), value);
    }
    Ok(vars)
}

fn print_change(change: &JobChange) {
    println!(
        "** {}: {} {:.0}%",
        change.job_id, change.status, change.progress
    );
    if let Some((master, aggregate)) = &change.master {
        if master != &change.job_id {
            println!(
                "*** {master}: {} {:.0}%",
                aggregate.status, aggregate.progress
            );
        }
    }
}

/// Keys worth following in a snapshot: every master, and every job that
/// is neither a master nor part of one.
fn snapshot_keys(snapshot: &SessionSnapshot) -> Vec<String> {
    let mut keys: Vec<String> = snapshot
        .masters
        .iter()
        .map(|m| m.master_id().clone())
        .collect();
    let owned: HashSet<&String> = snapshot
        .masters
        .iter()
        .flat_map(|m| m.individuals().iter().map(|a| a.job_id()))
        .collect();
    for job in &snapshot.jobs {
        if !owned.contains(job.job_id()) && !keys.contains(job.job_id()) {
            keys.push(job.job_id().clone());
        }
    }
    keys
}

async fn print_outcome(tracker: &Tracker, key: &str) {
    let aggregate = tracker.aggregate(key).await;
    println!(
        "*** {key}: {} {:.0}% ***",
        aggregate.status, aggregate.progress
    );
    for view in tracker.host_views(key).await {
        print!("{}", render_text(&view));
    }
}

/// Apply poll events until every tracked job is done, keeping the session
/// snapshot current so an interrupted watch can be resumed.
pub(crate) async fn follow(context: &CliContext<'_>, tracker: &Tracker, keys: &[String]) -> Result<()> {
    let store = context.store()?;
    store.save_session(&tracker.snapshot().await).await?;

    while !tracker.is_idle().await {
        tokio::select! {
            change = tracker.next_change() => {
                let Some(change) = change else {
                    break;
                };
                print_change(&change);
                store.save_session(&tracker.snapshot().await).await?;
            }
            _ = tokio::signal::ctrl_c() => {
                println!("* stopped watching, resume with `playtrack watch`");
                return Ok(());
            }
        }
    }

    for key in keys {
        print_outcome(tracker, key).await;
    }
    store.clear_session().await?;
    Ok(())
}

async fn restore_session(context: &CliContext<'_>, tracker: &Tracker) -> Result<SessionSnapshot> {
    let snapshot = context
        .store()?
        .load_session()
        .await
        .unwrap_or_else(|e| {
            warn!("ignoring unreadable session: {e}");
            None
        })
        .unwrap_or_default();
    if !snapshot.is_empty() {
        tracker.restore(snapshot.clone()).await;
    }
    Ok(snapshot)
}

pub struct RunCommand;

impl RunCommand {
    async fn pick_playbook(&self, context: &CliContext<'_>) -> Result<String> {
        let playbooks = context.api.playbooks().await?;
        if playbooks.is_empty() {
            return Err(CommandErrors::RequiredUserInputMissing("playbook".into()).into());
        }
        let names: Vec<&str> = playbooks.iter().map(|p| p.name.as_str()).collect();
        let choice = FuzzySelect::new()
            .with_prompt("Playbook")
            .items(&names)
            .interact()
            .map_err(CommandErrors::PromptInteractionFailed)?;
        Ok(playbooks[choice].name.clone())
    }
}

#[async_trait]
impl<'a> Command<'a> for RunCommand {
    fn new() -> Self {
        Self
    }

    async fn run(&self, context: &'a CliContext<'a>) -> Result<()> {
        let matches = context.matches;
        let playbook = match matches.get_one::<String>("playbook") {
            Some(playbook) => playbook.clone(),
            None => self.pick_playbook(context).await?,
        };
        let hosts: Vec<String> = matches
            .get_many::<String>("hosts")
            .ok_or_else(|| CommandErrors::RequiredUserInputMissing("hosts".into()))?
            .cloned()
            .collect();
        let extra_vars = parse_extra_vars(matches.get_many::<String>("extra-var").into_iter().flatten())?;
        let per_host = matches.get_flag("per-host").then_some(true);

        let tracker = context.tracker().await?;
        restore_session(context, &tracker).await?;
        let submission = tracker
            .submit(SubmitRequest {
                playbook: playbook.clone(),
                hosts,
                extra_vars,
                per_host,
            })
            .await
            .wrap_err_with(|| format!("submitting {playbook}"))?;

        println!("* submitted {playbook} as {}", submission.key);
        for job in &submission.jobs {
            println!("** job {}: {}", job.job_id, job.hosts.join(", "));
        }
        for (host, error) in &submission.failures {
            println!("! {host}: {error}");
        }

        if matches.get_flag("no-watch") {
            context.store()?.save_session(&tracker.snapshot().await).await?;
            println!("* follow it with `playtrack watch`");
            return Ok(());
        }
        follow(context, &tracker, &[submission.key]).await
    }
}

pub struct StatusCommand;

impl<'a> Interactive<'a> for StatusCommand {}

#[async_trait]
impl<'a> Command<'a> for StatusCommand {
    fn new() -> Self {
        Self
    }

    async fn run(&self, context: &'a CliContext<'a>) -> Result<()> {
        let job_id = self.read_argument_with_validator(context.matches, "job-id", &mut |_| Ok(()))?;
        let response = context.api.status(&job_id).await?;
        match response.progress {
            Some(progress) => println!("*** job {job_id}: {} {progress:.0}% ***", response.status),
            None => println!("*** job {job_id}: {} ***", response.status),
        }

        if context.matches.get_flag("raw") {
            println!("{}", response.output);
            return Ok(());
        }
        let parsed = parse(&response.output);
        if context.matches.get_flag("export") {
            print!("{}", summary_export(&parsed, response.status, &response.output));
            return Ok(());
        }
        let hosts = parsed.hosts();
        if hosts.is_empty() && !response.output.is_empty() {
            println!("{}", response.output);
        }
        for host in hosts {
            print!("{}", render_text(&render(&host, &parsed)));
        }
        for (label, value) in render_summary(parsed.summary_fields()) {
            println!("** {label}: {value}");
        }
        Ok(())
    }
}

pub struct CancelCommand;

impl<'a> Interactive<'a> for CancelCommand {}

#[async_trait]
impl<'a> Command<'a> for CancelCommand {
    fn new() -> Self {
        Self
    }

    async fn run(&self, context: &'a CliContext<'a>) -> Result<()> {
        let job_id = self.read_argument_with_validator(context.matches, "job-id", &mut |_| Ok(()))?;
        let tracker = context.tracker().await?;
        restore_session(context, &tracker).await?;

        let cancelled = tracker.cancel(&job_id).await?;
        for id in &cancelled {
            println!("* cancelled {id}");
        }

        let store = context.store()?;
        let snapshot = tracker.snapshot().await;
        if tracker.is_idle().await {
            store.clear_session().await?;
        } else {
            store.save_session(&snapshot).await?;
        }
        Ok(())
    }
}

pub struct WatchCommand;

#[async_trait]
impl<'a> Command<'a> for WatchCommand {
    fn new() -> Self {
        Self
    }

    async fn run(&self, context: &'a CliContext<'a>) -> Result<()> {
        let tracker = context.tracker().await?;
        let snapshot = restore_session(context, &tracker).await?;
        if snapshot.is_empty() {
            println!("* nothing to watch");
            return Ok(());
        }
        let keys = snapshot_keys(&snapshot);
        println!("* watching {}", keys.join(", "));
        follow(context, &tracker, &keys).await
    }
}
