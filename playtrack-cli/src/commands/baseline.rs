use async_trait::async_trait;
use clap::ArgMatches;
use color_eyre::eyre::Result;
use playtrack::baseline::{generate_password, HostConfig, DEFAULT_PASSWORD_LEN, MIN_PASSWORD_LEN};
use playtrack::log::*;

use super::{CliContext, Command, CommandErrors, Interactive};

fn mask(password: &str, reveal: bool) -> String {
    if reveal {
        password.to_string()
    } else {
        "*".repeat(password.chars().count())
    }
}

fn password_rule(input: &String) -> Result<(), CommandErrors> {
    if input.chars().count() >= MIN_PASSWORD_LEN {
        Ok(())
    } else {
        Err(CommandErrors::InputValidationFailure(
            "password".into(),
            format!("at least {MIN_PASSWORD_LEN} characters"),
        ))
    }
}

pub struct BaselineCommand;

impl<'a> Interactive<'a> for BaselineCommand {}

impl BaselineCommand {
    async fn subcommand_configure<'a>(
        &self,
        context: &'a CliContext<'a>,
        matches: &'a ArgMatches,
    ) -> Result<()> {
        let host = self.read_argument_with_validator(matches, "host", &mut |input| {
            if input.trim().is_empty() {
                Err(CommandErrors::RequiredUserInputMissing("host".into()))
            } else {
                Ok(())
            }
        })?;
        let new_hostname = match matches.get_one::<String>("hostname") {
            Some(name) => name.clone(),
            None if matches.get_flag("generate") => host.clone(),
            None => self.prompt_for_input_with_default("New hostname", host.as_str())?,
        };
        let new_hostname = (new_hostname != host).then_some(new_hostname);

        let config = if matches.get_flag("generate") {
            HostConfig::generated(new_hostname)
        } else {
            HostConfig {
                new_hostname,
                partner_password: self.prompt_for_password("Partner (parceiro) password", password_rule)?,
                root_password: self.prompt_for_password("Root password", password_rule)?,
            }
        };

        let generated = matches.get_flag("generate");
        context.host_configs()?.save(&host, config.clone()).await?;
        info!("saved baseline config for {host}");
        println!("* saved baseline config for {host}");
        println!("** hostname: {}", config.hostname_for(&host));
        println!("** parceiro: {}", mask(&config.partner_password, generated));
        println!("** root: {}", mask(&config.root_password, generated));
        Ok(())
    }

    async fn subcommand_show<'a>(
        &self,
        context: &'a CliContext<'a>,
        matches: &'a ArgMatches,
    ) -> Result<()> {
        let reveal = matches.get_flag("reveal");
        let mut configs: Vec<(String, HostConfig)> =
            context.host_configs()?.load_all().await?.into_iter().collect();
        configs.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some(host) = matches.get_one::<String>("host") {
            configs.retain(|(h, _)| h == host);
        }
        if configs.is_empty() {
            println!("* no baseline configs");
            return Ok(());
        }
        for (host, config) in configs {
            println!("*** {host} ***");
            println!("** hostname: {}", config.hostname_for(&host));
            println!("** parceiro: {}", mask(&config.partner_password, reveal));
            println!("** root: {}", mask(&config.root_password, reveal));
        }
        Ok(())
    }

    async fn subcommand_remove<'a>(
        &self,
        context: &'a CliContext<'a>,
        matches: &'a ArgMatches,
    ) -> Result<()> {
        let host = self.read_argument_with_validator(matches, "host", &mut |_| Ok(()))?;
        if context.host_configs()?.remove(&host).await? {
            println!("* removed baseline config for {host}");
        } else {
            println!("* no baseline config for {host}");
        }
        Ok(())
    }

    fn subcommand_generate_password(&self, matches: &ArgMatches) -> Result<()> {
        let len = matches
            .get_one::<usize>("length")
            .copied()
            .unwrap_or(DEFAULT_PASSWORD_LEN);
        println!("{}", generate_password(len));
        Ok(())
    }
}

#[async_trait]
impl<'a> Command<'a> for BaselineCommand {
    fn new() -> Self {
        Self
    }

    async fn run(&self, context: &'a CliContext<'a>) -> Result<()> {
        match context.matches.subcommand() {
            Some(("configure", matches)) => self.subcommand_configure(context, matches).await,
            Some(("show", matches)) => self.subcommand_show(context, matches).await,
            Some(("remove", matches)) => self.subcommand_remove(context, matches).await,
            Some(("generate-password", matches)) => self.subcommand_generate_password(matches),
            Some((other, _)) => Err(CommandErrors::InvalidSubcommand(other.to_string()).into()),
            None => Err(CommandErrors::NoSubcommandProvided.into()),
        }
    }
}
