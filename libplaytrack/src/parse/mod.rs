//! Parsing of raw `ansible-playbook` output.
//!
//! [`parse`] is a pure function of its input: it keeps no state between
//! calls, never fails, and returns structurally equal results for equal
//! input. It is re-run on the full output every time a poll returns, so
//! partial output simply yields a partial [`ParsedOutput`].

use std::collections::BTreeMap;
use std::sync::OnceLock;

use derive_getters::Getters;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// What happened to one host in one task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    Ok,
    Changed,
    Failed,
    Skipped,
    Unreachable,
}

impl TaskOutcome {
    fn from_prefix(prefix: &str, rest: &str) -> Option<Self> {
        match prefix.to_ascii_lowercase().as_str() {
            "ok" => Some(TaskOutcome::Ok),
            "changed" => Some(TaskOutcome::Changed),
            "failed" => Some(TaskOutcome::Failed),
            "skipping" | "skipped" => Some(TaskOutcome::Skipped),
            "unreachable" => Some(TaskOutcome::Unreachable),
            "fatal" if rest.contains("UNREACHABLE") => Some(TaskOutcome::Unreachable),
            "fatal" => Some(TaskOutcome::Failed),
            _ => None,
        }
    }

    /// Severity used to summarize a task over all of its hosts.
    fn severity(&self) -> u8 {
        match self {
            TaskOutcome::Ok => 0,
            TaskOutcome::Skipped => 1,
            TaskOutcome::Changed => 2,
            TaskOutcome::Unreachable => 3,
            TaskOutcome::Failed => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Ok => "ok",
            TaskOutcome::Changed => "changed",
            TaskOutcome::Failed => "failed",
            TaskOutcome::Skipped => "skipped",
            TaskOutcome::Unreachable => "unreachable",
        }
    }
}

/// Per-host counters from the `PLAY RECAP` section.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recap {
    pub ok: u32,
    pub changed: u32,
    pub unreachable: u32,
    pub failed: u32,
    pub skipped: u32,
}

impl Recap {
    pub fn succeeded(&self) -> bool {
        self.failed == 0 && self.unreachable == 0
    }
}

/// Facts gathered about one host from the output.
#[derive(Getters, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDetails {
    hostname: String,
    /// The `Hostname:` value the playbook reported, e.g. after a rename.
    reported_hostname: Option<String>,
    public_ip: Option<String>,
    private_ip: Option<String>,
    system: Option<String>,
    root_password: Option<String>,
    partner_password: Option<String>,
    recap: Option<Recap>,
}

impl HostDetails {
    fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            ..Self::default()
        }
    }

    fn set_label(&mut self, label: SummaryLabel, value: &str) {
        let slot = match label {
            SummaryLabel::Hostname => &mut self.reported_hostname,
            SummaryLabel::PublicIp => &mut self.public_ip,
            SummaryLabel::PrivateIp => &mut self.private_ip,
            SummaryLabel::System => &mut self.system,
            SummaryLabel::RootPassword => &mut self.root_password,
            SummaryLabel::PartnerPassword => &mut self.partner_password,
        };
        if slot.is_none() {
            *slot = Some(value.to_string());
        }
    }
}

#[derive(Getters, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDetail {
    host: String,
    outcome: TaskOutcome,
    text: String,
}

#[derive(Getters, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    play: String,
    name: String,
    hosts: Vec<(String, TaskOutcome)>,
    details: Vec<TaskDetail>,
}

impl TaskRecord {
    fn new(play: &str, name: &str) -> Self {
        Self {
            play: play.to_string(),
            name: name.to_string(),
            hosts: vec![],
            details: vec![],
        }
    }

    pub fn outcome_for(&self, host: &str) -> Option<TaskOutcome> {
        self.hosts
            .iter()
            .find(|(h, _)| h == host)
            .map(|(_, outcome)| *outcome)
    }

    /// The most severe outcome over all hosts, `None` while no host reported.
    pub fn overall(&self) -> Option<TaskOutcome> {
        self.hosts
            .iter()
            .map(|(_, outcome)| *outcome)
            .max_by_key(TaskOutcome::severity)
    }

    fn record(&mut self, host: &str, outcome: TaskOutcome) {
        if self.outcome_for(host).is_none() {
            self.hosts.push((host.to_string(), outcome));
        }
    }
}

/// Labels extracted from `Label: value` lines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SummaryLabel {
    Hostname,
    PublicIp,
    PrivateIp,
    System,
    RootPassword,
    PartnerPassword,
}

impl SummaryLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryLabel::Hostname => "Hostname",
            SummaryLabel::PublicIp => "IP Público",
            SummaryLabel::PrivateIp => "IP Privado",
            SummaryLabel::System => "Sistema",
            SummaryLabel::RootPassword => "Senha root",
            SummaryLabel::PartnerPassword => "Senha parceiro",
        }
    }

    fn from_match(text: &str) -> Option<Self> {
        let lower = text.to_lowercase();
        if lower == "hostname" {
            Some(SummaryLabel::Hostname)
        } else if lower.starts_with("ip p") && lower.ends_with("blico") {
            Some(SummaryLabel::PublicIp)
        } else if lower == "ip privado" {
            Some(SummaryLabel::PrivateIp)
        } else if lower == "sistema" {
            Some(SummaryLabel::System)
        } else if lower.ends_with("root") {
            Some(SummaryLabel::RootPassword)
        } else if lower.ends_with("parceiro") {
            Some(SummaryLabel::PartnerPassword)
        } else {
            None
        }
    }
}

#[derive(Getters, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedOutput {
    tasks: Vec<TaskRecord>,
    host_details: BTreeMap<String, HostDetails>,
    summary_fields: Vec<(String, String)>,
    /// Non-blank lines no structural pattern matched, verbatim. Lines that
    /// only carried a labeled value are kept here too.
    passthrough: Vec<String>,
}

impl ParsedOutput {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
            && self.host_details.is_empty()
            && self.summary_fields.is_empty()
            && self.passthrough.is_empty()
    }

    /// Every host the output mentions, in first-seen order.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = vec![];
        let seen = self
            .tasks
            .iter()
            .flat_map(|task| task.hosts.iter().map(|(host, _)| host))
            .chain(self.host_details.keys());
        for host in seen {
            if !hosts.contains(host) {
                hosts.push(host.clone());
            }
        }
        hosts
    }

    pub fn summary_value(&self, label: SummaryLabel) -> Option<&str> {
        self.summary_fields
            .iter()
            .find(|(l, _)| l == label.as_str())
            .map(|(_, v)| v.as_str())
    }

    /// Sum of all hosts' recap counters.
    pub fn totals(&self) -> Recap {
        self.host_details
            .values()
            .filter_map(|details| details.recap)
            .fold(Recap::default(), |mut total, recap| {
                total.ok += recap.ok;
                total.changed += recap.changed;
                total.unreachable += recap.unreachable;
                total.failed += recap.failed;
                total.skipped += recap.skipped;
                total
            })
    }

    fn details_mut(&mut self, host: &str) -> &mut HostDetails {
        self.host_details
            .entry(host.to_string())
            .or_insert_with(|| HostDetails::new(host))
    }

    fn add_summary(&mut self, label: SummaryLabel, value: &str) {
        if self.summary_value(label).is_none() {
            self.summary_fields
                .push((label.as_str().to_string(), value.to_string()));
        }
    }
}

struct Patterns {
    play: Regex,
    task: Regex,
    status: Regex,
    recap: Regex,
    skipped: Regex,
    label: Regex,
    sentence: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        play: Regex::new(r"^PLAY \[(.*)\]").expect("play pattern"),
        task: Regex::new(r"^(?:TASK|RUNNING HANDLER) \[(.*)\]").expect("task pattern"),
        status: Regex::new(r"(?i)^(ok|changed|failed|fatal|skipping|skipped|unreachable):\s*\[([^\]]+)\](.*)$")
            .expect("status pattern"),
        recap: Regex::new(
            r"^(\S+)\s*:\s*ok=(\d+)\s+changed=(\d+)\s+unreachable=(\d+)\s+failed=(\d+)",
        )
        .expect("recap pattern"),
        skipped: Regex::new(r"skipped=(\d+)").expect("skipped pattern"),
        label: Regex::new(
            r"(?i)\b(hostname|ip p[úu]blico|ip privado|sistema|senha (?:do )?root|senha (?:do )?parceiro)\s*:\s*(.+)$",
        )
        .expect("label pattern"),
        sentence: Regex::new(r"(?i)a senha do usu[áa]rio (parceiro|root) [ée]:\s*\[([^\]]+)\]")
            .expect("sentence pattern"),
    })
}

/// A labeled value on `line`, either `Label: value` or the sentence form
/// the baseline playbook prints generated passwords in.
fn labeled_value<'l>(patterns: &Patterns, line: &'l str) -> Option<(SummaryLabel, &'l str)> {
    if let Some(caps) = patterns.label.captures(line) {
        let label = SummaryLabel::from_match(caps.get(1)?.as_str())?;
        return Some((label, clean_value(caps.get(2)?.as_str())));
    }
    let caps = patterns.sentence.captures(line)?;
    let label = SummaryLabel::from_match(caps.get(1)?.as_str())?;
    Some((label, caps.get(2)?.as_str().trim()))
}

/// Parse raw output into tasks, per-host outcomes, recap counters and
/// labeled summary values.
pub fn parse(raw: &str) -> ParsedOutput {
    let patterns = patterns();
    let mut out = ParsedOutput::default();
    let mut play = String::new();
    let mut current_task: Option<usize> = None;
    let mut current_host: Option<String> = None;
    let mut in_recap = false;
    // task index, detail index and nesting of a result spanning several lines
    let mut block: Option<(usize, usize, i32)> = None;

    for original in raw.lines() {
        let line = original.trim();
        if line.is_empty() {
            continue;
        }
        let mut opened = None;

        let structural = if line.starts_with("PLAY RECAP") {
            in_recap = true;
            current_task = None;
            true
        } else if let Some(caps) = patterns.play.captures(line) {
            play = caps[1].to_string();
            in_recap = false;
            current_task = None;
            true
        } else if let Some(caps) = patterns.task.captures(line) {
            out.tasks.push(TaskRecord::new(&play, &caps[1]));
            current_task = Some(out.tasks.len() - 1);
            in_recap = false;
            true
        } else if let Some(caps) = patterns.status.captures(line) {
            let host = strip_delegation(&caps[2]);
            let rest = &caps[3];
            if let Some(outcome) = TaskOutcome::from_prefix(&caps[1], rest) {
                let task = current_task.and_then(|i| out.tasks.get_mut(i).map(|task| (i, task)));
                if let Some((i, task)) = task {
                    task.record(&host, outcome);
                    if let Some((_, text)) = rest.split_once("=> ") {
                        let text = text.trim();
                        task.details.push(TaskDetail {
                            host: host.clone(),
                            outcome,
                            text: text.to_string(),
                        });
                        let depth = nesting(text);
                        if depth > 0 {
                            opened = Some((i, task.details.len() - 1, depth));
                        }
                    }
                }
                current_host = Some(host);
            }
            true
        } else if in_recap {
            match patterns.recap.captures(line) {
                Some(caps) => {
                    let count = |i: usize| caps[i].parse::<u32>().unwrap_or_default();
                    let recap = Recap {
                        ok: count(2),
                        changed: count(3),
                        unreachable: count(4),
                        failed: count(5),
                        skipped: patterns
                            .skipped
                            .captures(line)
                            .and_then(|c| c[1].parse().ok())
                            .unwrap_or_default(),
                    };
                    out.details_mut(&caps[1]).recap = Some(recap);
                    true
                }
                None => false,
            }
        } else {
            false
        };

        if let Some((label, value)) = labeled_value(patterns, line) {
            if !value.is_empty() {
                out.add_summary(label, value);
                if let Some(host) = current_host.as_deref() {
                    out.details_mut(host).set_label(label, value);
                }
            }
        }

        if structural {
            block = opened;
        } else if let Some((task_index, detail_index, depth)) = block {
            if let Some(detail) = out
                .tasks
                .get_mut(task_index)
                .and_then(|task| task.details.get_mut(detail_index))
            {
                detail.text.push(' ');
                detail.text.push_str(line);
            }
            let depth = depth + nesting(line);
            block = (depth > 0).then_some((task_index, detail_index, depth));
        }

        if !structural {
            out.passthrough.push(original.trim_end().to_string());
        }
    }

    out
}

/// The lines of `raw` that mention `host`, for output shared by several
/// hosts.
pub fn lines_for_host(raw: &str, host: &str) -> String {
    if host.is_empty() {
        return String::new();
    }
    raw.lines()
        .filter(|line| line.contains(host))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Net count of `{`/`[` opened on `text`, ignoring those inside JSON strings.
fn nesting(text: &str) -> i32 {
    let mut depth = 0;
    let mut in_string = false;
    let mut escaped = false;
    for c in text.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
        } else {
            match c {
                '"' => in_string = true,
                '{' | '[' => depth += 1,
                '}' | ']' => depth -= 1,
                _ => {}
            }
        }
    }
    depth
}

fn strip_delegation(host: &str) -> String {
    host.split(" -> ").next().unwrap_or(host).trim().to_string()
}

/// Strip the quoting Ansible's debug output wraps values in.
fn clean_value(value: &str) -> &str {
    value
        .trim()
        .trim_end_matches(|c: char| matches!(c, '"' | '\'' | ',' | '}' | ']') || c.is_whitespace())
        .trim_start_matches(|c: char| c == '"' || c == '\'' || c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASELINE_RUN: &str = r#"
PLAY [Baseline] ****************************************************************

TASK [Gathering Facts] *********************************************************
ok: [web01]
ok: [db01]

TASK [Set hostname] ************************************************************
changed: [web01]
fatal: [db01]: UNREACHABLE! => {"changed": false, "msg": "timed out"}

TASK [Show summary] ************************************************************
ok: [web01] => {
    "msg": [
        "Hostname: web01-prod",
        "IP Público: 200.1.2.3",
        "IP Privado: 10.0.0.5",
        "Sistema: Ubuntu 22.04",
        "Senha root: s3cretRoot!",
        "Senha parceiro: p4rtnerPass"
    ]
}

PLAY RECAP *********************************************************************
web01                      : ok=3    changed=1    unreachable=0    failed=0    skipped=2    rescued=0    ignored=0
db01                       : ok=1    changed=0    unreachable=1    failed=0    skipped=0    rescued=0    ignored=0
"#;

    #[test]
    fn test_tasks_and_outcomes_are_extracted() {
        let parsed = parse(BASELINE_RUN);
        assert_eq!(3, parsed.tasks().len());
        let set_hostname = &parsed.tasks()[1];
        assert_eq!("Baseline", set_hostname.play());
        assert_eq!("Set hostname", set_hostname.name());
        assert_eq!(Some(TaskOutcome::Changed), set_hostname.outcome_for("web01"));
        assert_eq!(Some(TaskOutcome::Unreachable), set_hostname.outcome_for("db01"));
        assert_eq!(Some(TaskOutcome::Unreachable), set_hostname.overall());
        assert_eq!(1, set_hostname.details().len());
        assert_eq!(vec!["web01".to_string(), "db01".to_string()], parsed.hosts());
    }

    #[test]
    fn test_recap_is_attached_to_hosts() {
        let parsed = parse(BASELINE_RUN);
        let web = parsed.host_details()["web01"].recap().unwrap();
        assert_eq!(
            Recap {
                ok: 3,
                changed: 1,
                unreachable: 0,
                failed: 0,
                skipped: 2
            },
            web
        );
        let db = parsed.host_details()["db01"].recap().unwrap();
        assert!(!db.succeeded());
        assert_eq!(4, parsed.totals().ok);
    }

    #[test]
    fn test_labeled_values_are_extracted() {
        let parsed = parse(BASELINE_RUN);
        assert_eq!(Some("web01-prod"), parsed.summary_value(SummaryLabel::Hostname));
        assert_eq!(Some("200.1.2.3"), parsed.summary_value(SummaryLabel::PublicIp));
        assert_eq!(Some("p4rtnerPass"), parsed.summary_value(SummaryLabel::PartnerPassword));

        let web = &parsed.host_details()["web01"];
        assert_eq!(&Some("web01-prod".to_string()), web.reported_hostname());
        assert_eq!(&Some("10.0.0.5".to_string()), web.private_ip());
        assert_eq!(&Some("Ubuntu 22.04".to_string()), web.system());
        assert_eq!(&Some("s3cretRoot!".to_string()), web.root_password());
        assert_eq!(&None, parsed.host_details()["db01"].system());
    }

    #[test]
    fn test_first_status_for_a_host_wins() {
        let parsed = parse("TASK [x]\nok: [h1]\nfailed: [h1]");
        assert_eq!(Some(TaskOutcome::Ok), parsed.tasks()[0].outcome_for("h1"));
        assert_eq!(1, parsed.tasks()[0].hosts().len());
    }

    #[test]
    fn test_parse_is_deterministic() {
        assert_eq!(parse(BASELINE_RUN), parse(BASELINE_RUN));
    }

    #[test]
    fn test_empty_and_garbage_input() {
        assert!(parse("").is_empty());
        assert!(parse("\n\n   \n").is_empty());

        let parsed = parse("Connecting...\n[WARNING]: no inventory\nok: [h1]");
        assert!(parsed.tasks().is_empty());
        assert_eq!(
            &vec!["Connecting...".to_string(), "[WARNING]: no inventory".to_string()],
            parsed.passthrough()
        );
    }

    #[test]
    fn test_skipping_and_delegation() {
        let parsed = parse("TASK [a]\nskipping: [h1]\nok: [h2 -> localhost]\nRUNNING HANDLER [restart]\nCHANGED: [h2]");
        assert_eq!(Some(TaskOutcome::Skipped), parsed.tasks()[0].outcome_for("h1"));
        assert_eq!(Some(TaskOutcome::Ok), parsed.tasks()[0].outcome_for("h2"));
        assert_eq!("restart", parsed.tasks()[1].name());
        assert_eq!(Some(TaskOutcome::Changed), parsed.tasks()[1].outcome_for("h2"));
    }

    #[test]
    fn test_recap_mode_ends_at_next_play() {
        let raw = "PLAY RECAP ***\nh1 : ok=1 changed=0 unreachable=0 failed=0\nPLAY [second]\nTASK [b]\nok: [h1]";
        let parsed = parse(raw);
        assert_eq!("second", parsed.tasks()[0].play());
        assert_eq!(1, parsed.host_details()["h1"].recap().unwrap().ok);
    }

    #[test]
    fn test_label_variants() {
        let raw = "TASK [facts]\nok: [h1]\n\"msg\": \"HOSTNAME: web01\",\nIP Publico: 200.0.0.1\nsistema: Debian 12\nSenha do root: r00t!\nSenha do parceiro: p4rc!";
        let parsed = parse(raw);
        assert_eq!(Some("web01"), parsed.summary_value(SummaryLabel::Hostname));
        assert_eq!(Some("200.0.0.1"), parsed.summary_value(SummaryLabel::PublicIp));
        assert_eq!(Some("Debian 12"), parsed.summary_value(SummaryLabel::System));
        assert_eq!(Some("r00t!"), parsed.summary_value(SummaryLabel::RootPassword));
        assert_eq!(Some("p4rc!"), parsed.summary_value(SummaryLabel::PartnerPassword));
        assert_eq!(&Some("p4rc!".to_string()), parsed.host_details()["h1"].partner_password());
    }

    #[test]
    fn test_generated_passwords_in_sentence_form() {
        let raw = "TASK [partner]\nok: [web01] => {\n\"msg\": \"A senha do usuário parceiro é: [Abc12345!]\"\n}\nTASK [root]\nok: [web01] => {\n\"msg\": \"A senha do usuario root e: [Root#9876]\"\n}";
        let parsed = parse(raw);
        assert_eq!(Some("Abc12345!"), parsed.summary_value(SummaryLabel::PartnerPassword));
        assert_eq!(Some("Root#9876"), parsed.summary_value(SummaryLabel::RootPassword));
        let web = &parsed.host_details()["web01"];
        assert_eq!(&Some("Abc12345!".to_string()), web.partner_password());
        assert_eq!(&Some("Root#9876".to_string()), web.root_password());
    }

    #[test]
    fn test_fatal_failed_is_a_failure() {
        let parsed = parse("TASK [x]\nfatal: [h1]: FAILED! => {\"msg\": \"boom\"}");
        let task = &parsed.tasks()[0];
        assert_eq!(Some(TaskOutcome::Failed), task.outcome_for("h1"));
        assert_eq!("{\"msg\": \"boom\"}", task.details()[0].text());
    }

    #[test]
    fn test_multi_line_result_is_kept_as_one_detail() {
        let raw = "TASK [disk]\nfatal: [h1]: FAILED! => {\n    \"changed\": false,\n    \"msg\": \"no space left {on} device\"\n}\nTASK [next]\nok: [h1]";
        let parsed = parse(raw);
        let detail = &parsed.tasks()[0].details()[0];
        assert_eq!(&TaskOutcome::Failed, detail.outcome());
        assert_eq!(
            "{ \"changed\": false, \"msg\": \"no space left {on} device\" }",
            detail.text()
        );
        assert!(parsed.tasks()[1].details().is_empty());
    }

    #[test]
    fn test_lines_for_host() {
        let raw = "TASK [a]\nok: [h1]\nok: [h2]\nh1 : ok=1";
        assert_eq!("ok: [h1]\nh1 : ok=1", lines_for_host(raw, "h1"));
        assert_eq!("", lines_for_host(raw, "h3"));
        assert_eq!("", lines_for_host(raw, ""));
    }
}
