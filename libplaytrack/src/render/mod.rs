//! Turning a [`ParsedOutput`] into something to show a user.
//!
//! Everything here borrows its input and builds new values, so rendering the
//! same partial output again after every poll is cheap to reason about.

use std::fmt;

use derive_getters::Getters;
use serde::Serialize;

use crate::job::JobStatus;
use crate::parse::{HostDetails, ParsedOutput, Recap, SummaryLabel, TaskOutcome};

/// Visual treatment of a task or task/host pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StyleClass {
    Success,
    Changed,
    Failed,
    Skipped,
    Pending,
}

impl StyleClass {
    pub fn from_outcome(outcome: Option<TaskOutcome>) -> Self {
        match outcome {
            Some(TaskOutcome::Ok) => StyleClass::Success,
            Some(TaskOutcome::Changed) => StyleClass::Changed,
            Some(TaskOutcome::Failed) | Some(TaskOutcome::Unreachable) => StyleClass::Failed,
            Some(TaskOutcome::Skipped) => StyleClass::Skipped,
            None => StyleClass::Pending,
        }
    }

    fn marker(&self) -> &'static str {
        match self {
            StyleClass::Success => "ok",
            StyleClass::Changed => "changed",
            StyleClass::Failed => "FAILED",
            StyleClass::Skipped => "skipped",
            StyleClass::Pending => "...",
        }
    }
}

#[derive(Getters, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HostOutcomeView {
    host: String,
    outcome: TaskOutcome,
    style: StyleClass,
}

#[derive(Getters, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TaskView {
    name: String,
    style: StyleClass,
    hosts: Vec<HostOutcomeView>,
    details: Vec<String>,
}

#[derive(Getters, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PlaybookView {
    name: String,
    tasks: Vec<TaskView>,
}

#[derive(Getters, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DisplayModel {
    hostname: String,
    info: Option<HostDetails>,
    playbooks: Vec<PlaybookView>,
    recap: Option<Recap>,
    /// Lines that matched no pattern, kept only when no task was found.
    log: Vec<String>,
    notice: Option<String>,
}

impl DisplayModel {
    /// A model with nothing to show but an explanation.
    pub fn only_notice<S: Into<String>>(hostname: &str, notice: S) -> Self {
        Self {
            hostname: hostname.to_string(),
            info: None,
            playbooks: vec![],
            recap: None,
            log: vec![],
            notice: Some(notice.into()),
        }
    }

    pub fn with_notice<S: Into<String>>(mut self, notice: S) -> Self {
        self.notice = Some(notice.into());
        self
    }

    pub fn recap_style(&self) -> Option<StyleClass> {
        self.recap.map(|recap| {
            if !recap.succeeded() {
                StyleClass::Failed
            } else if recap.changed > 0 {
                StyleClass::Changed
            } else {
                StyleClass::Success
            }
        })
    }
}

pub fn missing_output_notice(hostname: &str) -> String {
    format!("could not find per-host output for {hostname}")
}

/// Build the view of one host's part of `parsed`. When no task names the
/// host (e.g. the runner reported it under another alias) every task is
/// shown with its overall outcome.
pub fn render(hostname: &str, parsed: &ParsedOutput) -> DisplayModel {
    if parsed.is_empty() {
        return DisplayModel::only_notice(hostname, missing_output_notice(hostname));
    }

    let mentioned = parsed
        .tasks()
        .iter()
        .any(|task| task.outcome_for(hostname).is_some());

    let mut playbooks: Vec<PlaybookView> = vec![];
    for task in parsed.tasks() {
        let (style, hosts) = if mentioned {
            let Some(outcome) = task.outcome_for(hostname) else {
                continue;
            };
            let view = HostOutcomeView {
                host: hostname.to_string(),
                outcome,
                style: StyleClass::from_outcome(Some(outcome)),
            };
            (view.style, vec![view])
        } else {
            let views = task
                .hosts()
                .iter()
                .map(|(host, outcome)| HostOutcomeView {
                    host: host.clone(),
                    outcome: *outcome,
                    style: StyleClass::from_outcome(Some(*outcome)),
                })
                .collect();
            (StyleClass::from_outcome(task.overall()), views)
        };

        let details = task
            .details()
            .iter()
            .filter(|detail| !mentioned || detail.host() == hostname)
            .map(|detail| detail.text().clone())
            .collect();

        let view = TaskView {
            name: task.name().clone(),
            style,
            hosts,
            details,
        };
        match playbooks.iter_mut().find(|p| &p.name == task.play()) {
            Some(playbook) => playbook.tasks.push(view),
            None => playbooks.push(PlaybookView {
                name: task.play().clone(),
                tasks: vec![view],
            }),
        }
    }

    let info = parsed.host_details().get(hostname).cloned();
    let recap = info.as_ref().and_then(|details| *details.recap());
    let log = if playbooks.is_empty() {
        parsed.passthrough().clone()
    } else {
        vec![]
    };
    DisplayModel {
        hostname: hostname.to_string(),
        info,
        playbooks,
        recap,
        log,
        notice: None,
    }
}

const EXPORT_ORDER: [SummaryLabel; 6] = [
    SummaryLabel::Hostname,
    SummaryLabel::System,
    SummaryLabel::PrivateIp,
    SummaryLabel::PublicIp,
    SummaryLabel::PartnerPassword,
    SummaryLabel::RootPassword,
];

/// Summary fields as an ordered key/value list: known labels first in a
/// fixed order, anything else after them as found.
pub fn render_summary(fields: &[(String, String)]) -> Vec<(String, String)> {
    let rank = |label: &str| {
        EXPORT_ORDER
            .iter()
            .position(|known| known.as_str() == label)
            .unwrap_or(EXPORT_ORDER.len())
    };
    let mut out = fields.to_vec();
    out.sort_by_key(|(label, _)| rank(label));
    out
}

const EXPORT_RULE: &str = "===============================================";

/// The text a user copies out of a finished run: the summary block, the job
/// status, the task names by outcome and finally the full log.
pub fn summary_export(parsed: &ParsedOutput, status: JobStatus, raw: &str) -> String {
    let mut text = String::from("=========== RESUMO DA CONFIGURAÇÃO ===========\n");
    let mut line = |label: &str, value: Option<&str>| {
        if let Some(value) = value {
            text.push_str(&format!("{label}: {value}\n"));
        }
    };
    line("Hostname", parsed.summary_value(SummaryLabel::Hostname));
    line("Sistema", parsed.summary_value(SummaryLabel::System));
    line("IP Privado", parsed.summary_value(SummaryLabel::PrivateIp));
    line("IP Público", parsed.summary_value(SummaryLabel::PublicIp));
    line("Usuário", Some("parceiro"));
    line("Senha", parsed.summary_value(SummaryLabel::PartnerPassword));
    line("Usuário", Some("root"));
    line("Senha", parsed.summary_value(SummaryLabel::RootPassword));
    text.push_str(&format!("Status: {status}\n{EXPORT_RULE}\n"));

    let sections = [
        ("Tarefas Concluídas", &[TaskOutcome::Ok, TaskOutcome::Changed][..]),
        ("Tarefas Skipped", &[TaskOutcome::Skipped][..]),
        ("Tarefas Falhadas", &[TaskOutcome::Failed, TaskOutcome::Unreachable][..]),
    ];
    for (title, outcomes) in sections {
        text.push_str(&format!("\n{title}:\n"));
        for task in parsed.tasks() {
            if task.overall().map_or(false, |o| outcomes.contains(&o)) {
                text.push_str(&format!("- {}\n", task.name()));
            }
        }
    }

    text.push_str(&format!("\n{EXPORT_RULE}\n\n"));
    text.push_str(raw);
    text
}

pub fn render_text(model: &DisplayModel) -> String {
    model.to_string()
}

impl fmt::Display for DisplayModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "*** host: {} ***", self.hostname)?;
        if let Some(info) = &self.info {
            let fields = [
                ("hostname", info.reported_hostname()),
                ("system", info.system()),
                ("private ip", info.private_ip()),
                ("public ip", info.public_ip()),
            ];
            for (label, value) in fields {
                if let Some(value) = value {
                    writeln!(f, "** {label}: {value}")?;
                }
            }
        }
        for playbook in &self.playbooks {
            writeln!(f, "* PLAY [{}]", playbook.name)?;
            for task in &playbook.tasks {
                writeln!(f, "  [{}] {}", task.style.marker(), task.name)?;
                if task.hosts.len() > 1 {
                    for host in &task.hosts {
                        writeln!(f, "      {}: {}", host.host, host.outcome.as_str())?;
                    }
                }
                if task.style == StyleClass::Failed {
                    for detail in &task.details {
                        writeln!(f, "      => {detail}")?;
                    }
                }
            }
        }
        if let Some(recap) = &self.recap {
            writeln!(
                f,
                "* RECAP ok={} changed={} unreachable={} failed={} skipped={}",
                recap.ok, recap.changed, recap.unreachable, recap.failed, recap.skipped
            )?;
        }
        for line in &self.log {
            writeln!(f, "  {line}")?;
        }
        if let Some(notice) = &self.notice {
            writeln!(f, "! {notice}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse;

    const TWO_HOSTS: &str = "PLAY [web]\nTASK [install]\nok: [h1]\nfailed: [h2] => {\"msg\": \"no space\"}\nPLAY [db]\nTASK [migrate]\nchanged: [h2]\nPLAY RECAP\nh1 : ok=1 changed=0 unreachable=0 failed=0\nh2 : ok=0 changed=1 unreachable=0 failed=1";

    #[test]
    fn test_render_groups_by_playbook_for_one_host() {
        let parsed = parse(TWO_HOSTS);
        let model = render("h2", &parsed);
        let names: Vec<&str> = model.playbooks().iter().map(|p| p.name().as_str()).collect();
        assert_eq!(vec!["web", "db"], names);
        let install = &model.playbooks()[0].tasks()[0];
        assert_eq!(&StyleClass::Failed, install.style());
        assert_eq!(&vec!["{\"msg\": \"no space\"}".to_string()], install.details());
        assert_eq!(Some(StyleClass::Failed), model.recap_style());
        assert_eq!(None, *model.notice());

        let h1 = render("h1", &parsed);
        assert_eq!(1, h1.playbooks().len());
        assert!(h1.playbooks()[0].tasks()[0].details().is_empty());
        assert_eq!(Some(StyleClass::Success), h1.recap_style());
    }

    #[test]
    fn test_render_unknown_host_shows_all_tasks() {
        let parsed = parse("TASK [a]\nok: [10.0.0.5]\nchanged: [10.0.0.6]");
        let model = render("web01", &parsed);
        let task = &model.playbooks()[0].tasks()[0];
        assert_eq!(2, task.hosts().len());
        assert_eq!(&StyleClass::Changed, task.style());
        assert_eq!(None, *model.recap());
        assert!(model.log().is_empty());

        let bare = render("web01", &parse("Connecting...\nHostname: web01"));
        assert!(bare.playbooks().is_empty());
        assert_eq!(2, bare.log().len());
    }

    #[test]
    fn test_render_is_idempotent_and_empty_input_explains_itself() {
        let parsed = parse(TWO_HOSTS);
        assert_eq!(render("h1", &parsed), render("h1", &parsed));

        let model = render("h1", &parse(""));
        assert_eq!(&Some(missing_output_notice("h1")), model.notice());
        assert!(render_text(&model).contains("could not find per-host output for h1"));
    }

    #[test]
    fn test_summary_orders_known_labels_first() {
        let fields = vec![
            ("Custom".to_string(), "x".to_string()),
            ("Senha root".to_string(), "r00tr00t".to_string()),
            ("Hostname".to_string(), "web01".to_string()),
        ];
        let labels: Vec<String> = render_summary(&fields).into_iter().map(|(l, _)| l).collect();
        assert_eq!(vec!["Hostname", "Senha root", "Custom"], labels);
    }

    #[test]
    fn test_summary_export_layout() {
        let raw = "TASK [s]\nok: [h1] => {\n\"Hostname: web01\",\n\"Senha root: r00tr00t\"\n}\nTASK [t]\nskipping: [h1]\nTASK [u]\nfatal: [h1]: FAILED! => {\"msg\": \"boom\"}";
        let text = summary_export(&parse(raw), JobStatus::Failed, raw);
        assert!(text.starts_with("=========== RESUMO DA CONFIGURAÇÃO ===========\nHostname: web01\nUsuário: parceiro\nUsuário: root\nSenha: r00tr00t\nStatus: failed\n"));
        assert!(text.contains("Tarefas Concluídas:\n- s\n\nTarefas Skipped:\n- t\n\nTarefas Falhadas:\n- u\n"));
        assert!(text.ends_with(raw));
    }

    #[test]
    fn test_summary_export_with_nothing_finished() {
        let text = summary_export(&parse("TASK [pending]"), JobStatus::Running, "TASK [pending]");
        assert!(text.contains("Status: running\n"));
        assert!(text.contains("Tarefas Concluídas:\n\nTarefas Skipped:\n\nTarefas Falhadas:\n\n"));
        assert!(!text.contains("- pending"));
    }
}
