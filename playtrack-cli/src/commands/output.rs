use async_trait::async_trait;
use color_eyre::eyre::{Result, WrapErr};
use playtrack::job::JobStatus;
use playtrack::parse::parse;
use playtrack::render::{render, render_summary, render_text, summary_export};
use tokio::fs;

use super::{CliContext, Command, Interactive};

/// Parse a saved `ansible-playbook` log without talking to the runner.
pub struct OutputCommand;

impl<'a> Interactive<'a> for OutputCommand {}

#[async_trait]
impl<'a> Command<'a> for OutputCommand {
    fn new() -> Self {
        Self
    }

    async fn run(&self, context: &'a CliContext<'a>) -> Result<()> {
        let file = self.read_argument_with_validator(context.matches, "file", &mut |_| Ok(()))?;
        let raw = fs::read_to_string(&file)
            .await
            .wrap_err_with(|| format!("reading {file}"))?;
        let parsed = parse(&raw);

        if context.matches.get_flag("summary") {
            // a saved log carries no job status, the recap stands in for it
            let status = if parsed.totals().succeeded() {
                JobStatus::Completed
            } else {
                JobStatus::Failed
            };
            print!("{}", summary_export(&parsed, status, &raw));
            return Ok(());
        }

        let hosts = match context.matches.get_one::<String>("host") {
            Some(host) => vec![host.clone()],
            None => parsed.hosts(),
        };
        if hosts.is_empty() {
            println!("* no per-host output in {file}");
        }
        for host in hosts {
            print!("{}", render_text(&render(&host, &parsed)));
        }
        let totals = parsed.totals();
        println!(
            "* totals: ok={} changed={} unreachable={} failed={} skipped={}",
            totals.ok, totals.changed, totals.unreachable, totals.failed, totals.skipped
        );
        for (label, value) in render_summary(parsed.summary_fields()) {
            println!("** {label}: {value}");
        }
        Ok(())
    }
}
