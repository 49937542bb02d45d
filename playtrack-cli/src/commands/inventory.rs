use async_trait::async_trait;
use color_eyre::eyre::Result;
use playtrack::hosts::host_details;
use playtrack::ipc::RunnerApi;
use regex::Regex;

use super::{CliContext, Command, Interactive, HOSTNAME_PATTERN};

pub struct PlaybooksCommand;

#[async_trait]
impl<'a> Command<'a> for PlaybooksCommand {
    fn new() -> Self {
        Self
    }

    async fn run(&self, context: &'a CliContext<'a>) -> Result<()> {
        let playbooks = context.api.playbooks().await?;
        if playbooks.is_empty() {
            println!("* no playbooks on {}", context.config.server);
        }
        for playbook in playbooks {
            let per_host = if context.config.tracker.is_per_host(&playbook.name) {
                " [per host]"
            } else {
                ""
            };
            println!("* {} ({}){per_host}", playbook.name, playbook.path);
        }
        Ok(())
    }
}

pub struct HostCommand;

impl<'a> Interactive<'a> for HostCommand {}

#[async_trait]
impl<'a> Command<'a> for HostCommand {
    fn new() -> Self {
        Self
    }

    async fn run(&self, context: &'a CliContext<'a>) -> Result<()> {
        let pattern = Regex::new(HOSTNAME_PATTERN)?;
        let hostname =
            self.read_argument_with_regex_validation(context.matches, "hostname", &pattern)?;
        let facts = host_details(&*context.api, &hostname).await;
        println!("*** host: {hostname} ***");
        let fields = [
            ("hostname", &facts.hostname),
            ("system", &facts.system),
            ("private ip", &facts.private_ip),
            ("public ip", &facts.public_ip),
        ];
        for (label, value) in fields {
            println!("** {label}: {}", value.as_deref().unwrap_or("unknown"));
        }
        Ok(())
    }
}
