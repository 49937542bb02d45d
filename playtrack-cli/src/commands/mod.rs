use std::sync::Arc;

use async_trait::async_trait;
use clap::ArgMatches;
use color_eyre::eyre::{Result, WrapErr};
use dialoguer::{Input, Password};
use playtrack::baseline::BaselineHook;
use playtrack::hooks::{AntivirusHook, HookChain, Site24x7Hook};
use playtrack::ipc::HttpRunnerClient;
use playtrack::store::{HostConfigStore, LocalStore};
use playtrack::tracker::Tracker;
use regex::Regex;
use thiserror::Error;

use crate::config::Config;

pub mod baseline;
pub mod inventory;
pub mod job;
pub mod output;

/// Names accepted for inventory hosts.
pub(crate) const HOSTNAME_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9._-]*$";

#[derive(Error, Debug)]
pub enum CommandErrors {
    #[error("Prompt interaction failed.")]
    PromptInteractionFailed(
        #[from]
        #[source]
        dialoguer::Error,
    ),
    #[error("Required user input `{0}` is missing.")]
    RequiredUserInputMissing(String),
    #[error("Argument `{0}` failed validation `{1}`")]
    InputValidationFailure(String, String),
    #[error("Invalid subcommand `{0}`.")]
    InvalidSubcommand(String),
    #[error("No subcommand provided.")]
    NoSubcommandProvided,
}

pub struct CliContext<'a> {
    pub api: Arc<HttpRunnerClient>,
    pub config: Config,
    pub matches: &'a ArgMatches,
}

impl<'a> CliContext<'a> {
    pub fn new(config: Config, matches: &'a ArgMatches) -> Result<Self> {
        let api = HttpRunnerClient::new(config.server.as_str())
            .wrap_err_with(|| format!("building client for {}", config.server))?;
        Ok(Self {
            api: Arc::new(api),
            config,
            matches,
        })
    }

    pub fn store(&self) -> Result<LocalStore> {
        Ok(LocalStore::open(self.config.store_path()?))
    }

    pub fn host_configs(&self) -> Result<HostConfigStore> {
        Ok(HostConfigStore::new(self.store()?))
    }

    /// A tracker with every pre-submit hook registered, baseline configs
    /// read from the local store.
    pub async fn tracker(&self) -> Result<Tracker> {
        let configs = self.host_configs()?.load_all().await?;
        let mut hooks = HookChain::new();
        hooks
            .register(Site24x7Hook::new(self.config.site24x7()))
            .register(AntivirusHook::new(self.config.antivirus.clone()))
            .register(BaselineHook::new(configs));
        Ok(Tracker::new(
            self.api.clone(),
            self.config.tracker.clone(),
            hooks,
        ))
    }
}

#[async_trait]
pub trait Command<'a> {
    fn new() -> Self
    where
        Self: Sized;

    async fn run(&self, context: &'a CliContext<'a>) -> Result<()>;
}

pub trait Interactive<'a> {
    fn prompt_for_input_with_default<S: Into<String>>(
        &self,
        message: &str,
        default: S,
    ) -> Result<String> {
        Input::<String>::new()
            .with_prompt(message)
            .default(default.into())
            .interact_text()
            .map_err(CommandErrors::PromptInteractionFailed)
            .wrap_err("Prompting user input failed.")
    }

    /// Read a secret twice, asking again until `validator` accepts it.
    fn prompt_for_password<V>(&self, message: &'a str, mut validator: V) -> Result<String>
    where
        V: FnMut(&String) -> Result<(), CommandErrors>,
    {
        loop {
            let password = Password::new()
                .with_prompt(message)
                .with_confirmation("Repeat", "Values do not match")
                .interact()
                .map_err(CommandErrors::PromptInteractionFailed)
                .wrap_err("Prompting for password failed.")?;
            match validator(&password) {
                Ok(()) => return Ok(password),
                Err(e) => println!("! {e}"),
            }
        }
    }

    /// Read argument from the CLI args with a validation function.
    fn read_argument_with_validator<V>(
        &self,
        arg_matches: &'a ArgMatches,
        id: &'a str,
        validator: &mut V,
    ) -> Result<String>
    where
        V: FnMut(&String) -> Result<(), CommandErrors>,
    {
        if let Some(arg) = arg_matches.get_one::<String>(id) {
            validator(arg)?;
            Ok(arg.clone())
        } else {
            Err(CommandErrors::RequiredUserInputMissing(id.into()))?
        }
    }

    /// Read argument from the CLI args with regex validation.
    fn read_argument_with_regex_validation(
        &self,
        arg_matches: &'a ArgMatches,
        id: &'a str,
        regex: &Regex,
    ) -> Result<String> {
        self.read_argument_with_validator(arg_matches, id, &mut |input| {
            if regex.is_match(input) {
                Ok(())
            } else {
                Err(CommandErrors::InputValidationFailure(
                    id.into(),
                    regex.as_str().into(),
                ))
            }
        })
    }
}
