//! Approval policy: ordered first-match rules over record metadata.
//!
//! Rules are external configuration (YAML). The first rule whose conditions
//! all hold decides. When nothing matches, approval is required. A rule that
//! fails to compile stays in its slot and evaluates to an error, which the
//! gate turns into "required".

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use regex::Regex;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::PolicyError;
use crate::vault::record::{value_as_list, value_as_string};
use crate::vault::Record;

/// Written by `init` when no policy exists yet.
pub const SAMPLE_POLICY: &str = r#"# Approval rules. First match wins; no match means approval is required.
known_contacts:
  - "@yourcompany.com"
rules:
  - name: bulk-send
    when: { recipients_over: 5 }
    require: true
  - name: new-contact
    when: { new_contact: true }
    require: true
  - name: has-attachment
    when: { has_attachment: true }
    require: true
  - name: payment-threshold
    when: { amount_over: "100.00" }
    require: true
  - name: sensitive-keywords
    when: { keywords: [payment, invoice, contract, legal, money, bank] }
    require: true
  - name: known-contact-reply
    when: { known_contact: true, action: email_reply }
    require: false
"#;

#[derive(Debug, Default, Deserialize)]
struct PolicyDoc {
    #[serde(default)]
    known_contacts: Vec<String>,
    #[serde(default)]
    rules: Vec<RuleDoc>,
}

#[derive(Debug, Deserialize)]
struct RuleDoc {
    name: String,
    #[serde(default)]
    when: serde_yaml::Value,
    require: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct WhenDoc {
    new_contact: Option<bool>,
    known_contact: Option<bool>,
    has_attachment: Option<bool>,
    recipients_over: Option<usize>,
    amount_over: Option<serde_yaml::Value>,
    action: Option<String>,
    keywords: Option<Vec<String>>,
    field: Option<String>,
    matches: Option<String>,
}

/// A single compiled predicate.
#[derive(Debug, Clone)]
pub enum Condition {
    NewContact(bool),
    KnownContact(bool),
    HasAttachment(bool),
    RecipientsOver(usize),
    AmountOver(Decimal),
    Action(String),
    Keywords(Vec<String>),
    FieldMatches { field: String, regex: Regex },
}

/// A policy rule. `conditions` is `Err` when the rule could not be compiled.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub require: bool,
    conditions: Result<Vec<Condition>, String>,
}

impl Rule {
    pub fn new(name: impl Into<String>, require: bool, conditions: Vec<Condition>) -> Self {
        Self {
            name: name.into(),
            require,
            conditions: Ok(conditions),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.conditions.is_ok()
    }

    fn compile(doc: RuleDoc) -> Self {
        let conditions = compile_when(doc.when);
        if let Err(reason) = &conditions {
            warn!(rule = %doc.name, reason = %reason, "Approval rule failed to compile");
        }
        Self {
            name: doc.name,
            require: doc.require,
            conditions,
        }
    }
}

fn compile_when(when: serde_yaml::Value) -> Result<Vec<Condition>, String> {
    let when: WhenDoc = if when.is_null() {
        WhenDoc::default()
    } else {
        serde_yaml::from_value(when).map_err(|e| e.to_string())?
    };

    let mut out = Vec::new();
    if let Some(v) = when.new_contact {
        out.push(Condition::NewContact(v));
    }
    if let Some(v) = when.known_contact {
        out.push(Condition::KnownContact(v));
    }
    if let Some(v) = when.has_attachment {
        out.push(Condition::HasAttachment(v));
    }
    if let Some(n) = when.recipients_over {
        out.push(Condition::RecipientsOver(n));
    }
    if let Some(raw) = when.amount_over {
        let text = match raw {
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::String(s) => s,
            other => return Err(format!("amount_over must be a number, got {other:?}")),
        };
        let amount = parse_amount(&text).ok_or_else(|| format!("bad amount '{text}'"))?;
        out.push(Condition::AmountOver(amount));
    }
    if let Some(action) = when.action {
        out.push(Condition::Action(action.to_lowercase()));
    }
    if let Some(keywords) = when.keywords {
        out.push(Condition::Keywords(
            keywords.into_iter().map(|k| k.to_lowercase()).collect(),
        ));
    }
    match (when.field, when.matches) {
        (Some(field), Some(pattern)) => {
            let regex = Regex::new(&pattern).map_err(|e| format!("bad regex: {e}"))?;
            out.push(Condition::FieldMatches { field, regex });
        }
        (None, None) => {}
        _ => return Err("`field` and `matches` must be given together".to_string()),
    }
    if out.is_empty() {
        return Err("rule has no conditions".to_string());
    }
    Ok(out)
}

/// Parse a monetary amount such as `1,250.00`, `$99` or `100 USD`.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | '-'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    Decimal::from_str(&cleaned).ok()
}

/// What a rule match decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Human sign-off required. `rule` is `None` for the no-match default.
    Required { rule: Option<String>, reason: String },
    /// A known-safe rule matched.
    Exempt { rule: String },
}

impl Verdict {
    pub fn requires_approval(&self) -> bool {
        matches!(self, Self::Required { .. })
    }

    pub fn reason(&self) -> String {
        match self {
            Self::Required { reason, .. } => reason.clone(),
            Self::Exempt { rule } => format!("exempt by rule '{rule}'"),
        }
    }
}

/// The facts a policy is evaluated against: a record's metadata, optionally
/// overlaid with one proposed step.
#[derive(Debug, Clone, Default)]
pub struct Subject {
    pub action: Option<String>,
    pub fields: BTreeMap<String, serde_json::Value>,
    pub text: String,
}

impl Subject {
    pub fn from_record(record: &Record) -> Self {
        let mut text = record.meta_str("subject").unwrap_or_default();
        text.push('\n');
        text.push_str(&record.body);
        Self {
            action: record.meta_str("action"),
            fields: record.metadata.clone(),
            text,
        }
    }

    /// Overlay a proposed step. Step metadata wins over record metadata.
    pub fn with_step(
        mut self,
        action: &str,
        description: &str,
        metadata: &BTreeMap<String, serde_json::Value>,
    ) -> Self {
        self.action = Some(action.to_string());
        for (k, v) in metadata {
            self.fields.insert(k.clone(), v.clone());
        }
        self.text.push('\n');
        self.text.push_str(description);
        self
    }

    fn list(&self, key: &str) -> Vec<String> {
        value_as_list(self.fields.get(key))
    }

    fn string(&self, key: &str) -> Option<String> {
        self.fields.get(key).and_then(value_as_string)
    }

    /// Counterparties of the action: explicit recipients, or the sender the
    /// action would answer.
    pub fn contacts(&self) -> Vec<String> {
        let recipients = self.list("recipients");
        if !recipients.is_empty() {
            return recipients;
        }
        let to = self.list("to");
        if !to.is_empty() {
            return to;
        }
        self.list("sender")
    }
}

/// Strip a display name: `Jane <jane@x.com>` → `jane@x.com`.
fn bare_address(contact: &str) -> String {
    let trimmed = contact.trim();
    match (trimmed.rfind('<'), trimmed.rfind('>')) {
        (Some(start), Some(end)) if start < end => trimmed[start + 1..end].trim().to_lowercase(),
        _ => trimmed.to_lowercase(),
    }
}

/// Loaded, compiled policy.
#[derive(Debug, Clone, Default)]
pub struct ApprovalPolicy {
    known_contacts: Vec<String>,
    rules: Vec<Rule>,
}

impl ApprovalPolicy {
    /// The empty policy: nothing matches, so everything needs approval.
    pub fn fail_safe() -> Self {
        Self::default()
    }

    pub fn new(known_contacts: Vec<String>, rules: Vec<Rule>) -> Self {
        Self {
            known_contacts: known_contacts.into_iter().map(|c| c.to_lowercase()).collect(),
            rules,
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self, PolicyError> {
        Self::from_yaml_at(text, Path::new("<inline>"))
    }

    fn from_yaml_at(text: &str, path: &Path) -> Result<Self, PolicyError> {
        let doc: PolicyDoc = if text.trim().is_empty() {
            PolicyDoc::default()
        } else {
            serde_yaml::from_str(text).map_err(|e| PolicyError::Load {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        };
        let rules = doc.rules.into_iter().map(Rule::compile).collect();
        Ok(Self::new(doc.known_contacts, rules))
    }

    pub async fn load(path: &Path) -> Result<Self, PolicyError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PolicyError::Load {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        Self::from_yaml_at(&text, path)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn is_known(&self, contact: &str) -> bool {
        let address = bare_address(contact);
        self.known_contacts.iter().any(|known| {
            if known.starts_with('@') {
                address.ends_with(known.as_str())
            } else {
                address == *known
            }
        })
    }

    /// First-match evaluation. An uncompilable or unevaluable rule that is
    /// reached surfaces as an error; the caller must treat it as required.
    pub fn evaluate(&self, subject: &Subject) -> Result<Verdict, PolicyError> {
        for rule in &self.rules {
            let conditions = rule.conditions.as_ref().map_err(|reason| PolicyError::Evaluation {
                rule: rule.name.clone(),
                reason: reason.clone(),
            })?;

            let mut matched = true;
            for condition in conditions {
                let holds = self
                    .holds(condition, subject)
                    .map_err(|reason| PolicyError::Evaluation {
                        rule: rule.name.clone(),
                        reason,
                    })?;
                if !holds {
                    matched = false;
                    break;
                }
            }

            if matched {
                debug!(rule = %rule.name, require = rule.require, "Approval rule matched");
                return Ok(if rule.require {
                    Verdict::Required {
                        rule: Some(rule.name.clone()),
                        reason: format!("rule '{}' requires approval", rule.name),
                    }
                } else {
                    Verdict::Exempt {
                        rule: rule.name.clone(),
                    }
                });
            }
        }
        Ok(Verdict::Required {
            rule: None,
            reason: "no rule matched".to_string(),
        })
    }

    fn holds(&self, condition: &Condition, subject: &Subject) -> Result<bool, String> {
        Ok(match condition {
            Condition::NewContact(want) => {
                let contacts = subject.contacts();
                let any_new = contacts.iter().any(|c| !self.is_known(c));
                any_new == *want
            }
            Condition::KnownContact(want) => {
                let contacts = subject.contacts();
                let all_known = !contacts.is_empty() && contacts.iter().all(|c| self.is_known(c));
                all_known == *want
            }
            Condition::HasAttachment(want) => {
                let has = !subject.list("attachments").is_empty();
                has == *want
            }
            Condition::RecipientsOver(limit) => subject.contacts().len() > *limit,
            Condition::AmountOver(threshold) => match subject.string("amount") {
                None => false,
                Some(raw) => {
                    let amount =
                        parse_amount(&raw).ok_or_else(|| format!("unreadable amount '{raw}'"))?;
                    amount > *threshold
                }
            },
            Condition::Action(action) => subject
                .action
                .as_deref()
                .is_some_and(|a| a.eq_ignore_ascii_case(action)),
            Condition::Keywords(keywords) => {
                let text = subject.text.to_lowercase();
                keywords.iter().any(|k| text.contains(k.as_str()))
            }
            Condition::FieldMatches { field, regex } => subject
                .string(field)
                .is_some_and(|value| regex.is_match(&value)),
        })
    }

    /// One line per rule, for the engine prompt.
    pub fn summary(&self) -> String {
        if self.rules.is_empty() {
            return "No rules configured: every step requires approval.".to_string();
        }
        let mut out = String::new();
        for (i, rule) in self.rules.iter().enumerate() {
            let effect = if rule.require { "requires approval" } else { "auto-approved" };
            let state = if rule.is_valid() { "" } else { " (invalid, treated as required)" };
            out.push_str(&format!("{}. {} → {}{}\n", i + 1, rule.name, effect, state));
        }
        out.push_str("Anything not matched requires approval.");
        out
    }
}

struct Loaded {
    policy: Arc<ApprovalPolicy>,
    modified: Option<SystemTime>,
    checked: Instant,
}

/// Hot-reloading holder for the current policy.
pub struct PolicyStore {
    path: PathBuf,
    reload_every: Duration,
    inner: RwLock<Loaded>,
}

impl PolicyStore {
    /// Load the policy at `path`. A missing or broken file yields the
    /// fail-safe policy.
    pub async fn open(path: impl Into<PathBuf>, reload_every: Duration) -> Self {
        let path = path.into();
        let modified = mtime(&path).await;
        let policy = match ApprovalPolicy::load(&path).await {
            Ok(policy) => {
                info!(path = %path.display(), rules = policy.rules.len(), "Approval policy loaded");
                policy
            }
            Err(e) => {
                warn!(error = %e, "Using fail-safe approval policy");
                ApprovalPolicy::fail_safe()
            }
        };
        Self {
            path,
            reload_every,
            inner: RwLock::new(Loaded {
                policy: Arc::new(policy),
                modified,
                checked: Instant::now(),
            }),
        }
    }

    /// A store with a fixed in-memory policy.
    pub fn fixed(policy: ApprovalPolicy) -> Self {
        Self {
            path: PathBuf::new(),
            reload_every: Duration::MAX,
            inner: RwLock::new(Loaded {
                policy: Arc::new(policy),
                modified: None,
                checked: Instant::now(),
            }),
        }
    }

    pub async fn current(&self) -> Arc<ApprovalPolicy> {
        self.inner.read().await.policy.clone()
    }

    /// Re-read the file if the reload interval has passed and it changed.
    /// A file that no longer parses keeps the previous policy. Returns true
    /// when a new policy was installed.
    pub async fn refresh(&self) -> bool {
        if self.path.as_os_str().is_empty() {
            return false;
        }
        let mut inner = self.inner.write().await;
        if inner.checked.elapsed() < self.reload_every {
            return false;
        }
        inner.checked = Instant::now();

        let modified = mtime(&self.path).await;
        if modified.is_none() || modified == inner.modified {
            return false;
        }
        match ApprovalPolicy::load(&self.path).await {
            Ok(policy) => {
                info!(path = %self.path.display(), rules = policy.rules.len(), "Approval policy reloaded");
                inner.policy = Arc::new(policy);
                inner.modified = modified;
                true
            }
            Err(e) => {
                warn!(error = %e, "Approval policy reload failed, keeping previous rules");
                inner.modified = modified;
                false
            }
        }
    }
}

async fn mtime(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::{RecordId, RecordKind};
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn mail(sender: &str) -> Record {
        Record::new(RecordId::new("mail-1").unwrap(), RecordKind::MailItem)
            .with_meta("sender", json!(sender))
            .with_meta("subject", json!("Quick question"))
            .with_body("Can we talk tomorrow?")
    }

    fn sample() -> ApprovalPolicy {
        ApprovalPolicy::from_yaml(
            r#"
known_contacts: ["@acme.com", "boss@partner.org"]
rules:
  - name: bulk-send
    when: { recipients_over: 5 }
    require: true
  - name: new-contact
    when: { new_contact: true }
    require: true
  - name: has-attachment
    when: { has_attachment: true }
    require: true
  - name: payment-threshold
    when: { amount_over: 100 }
    require: true
  - name: known-contact-reply
    when: { known_contact: true, action: email_reply }
    require: false
"#,
        )
        .unwrap()
    }

    #[test]
    fn no_match_requires_approval() {
        let policy = ApprovalPolicy::fail_safe();
        let verdict = policy.evaluate(&Subject::from_record(&mail("a@b.com"))).unwrap();
        assert_eq!(
            verdict,
            Verdict::Required {
                rule: None,
                reason: "no rule matched".into()
            }
        );
    }

    #[test]
    fn new_contact_requires_approval() {
        let subject = Subject::from_record(&mail("stranger@else.net"))
            .with_step("email_reply", "reply", &BTreeMap::new());
        let verdict = sample().evaluate(&subject).unwrap();
        assert!(verdict.requires_approval());
        assert!(matches!(verdict, Verdict::Required { rule: Some(r), .. } if r == "new-contact"));
    }

    #[test]
    fn known_contact_reply_is_exempt() {
        let subject = Subject::from_record(&mail("Jane <jane@acme.com>"))
            .with_step("email_reply", "reply", &BTreeMap::new());
        let verdict = sample().evaluate(&subject).unwrap();
        assert_eq!(
            verdict,
            Verdict::Exempt {
                rule: "known-contact-reply".into()
            }
        );
    }

    #[test]
    fn first_match_beats_later_exemption() {
        let recipients: Vec<String> = (0..6).map(|i| format!("user{i}@acme.com")).collect();
        let mut meta = BTreeMap::new();
        meta.insert("recipients".to_string(), json!(recipients));
        let subject = Subject::from_record(&mail("boss@partner.org"))
            .with_step("email_reply", "bulk update", &meta);
        let verdict = sample().evaluate(&subject).unwrap();
        assert!(matches!(verdict, Verdict::Required { rule: Some(r), .. } if r == "bulk-send"));
    }

    #[test]
    fn amount_threshold_uses_decimal() {
        let policy = sample();
        let mut meta = BTreeMap::new();
        meta.insert("amount".to_string(), json!("$1,250.00"));
        let subject = Subject::from_record(&mail("jane@acme.com")).with_step("payment", "pay", &meta);
        let verdict = policy.evaluate(&subject).unwrap();
        assert!(matches!(verdict, Verdict::Required { rule: Some(r), .. } if r == "payment-threshold"));

        assert_eq!(parse_amount("$1,250.00"), Some(dec!(1250.00)));
        assert_eq!(parse_amount("n/a"), None);
    }

    #[test]
    fn unreadable_amount_is_an_evaluation_error() {
        let mut meta = BTreeMap::new();
        meta.insert("amount".to_string(), json!("lots"));
        let subject = Subject::from_record(&mail("jane@acme.com")).with_step("payment", "pay", &meta);
        let err = sample().evaluate(&subject).unwrap_err();
        assert!(matches!(err, PolicyError::Evaluation { rule, .. } if rule == "payment-threshold"));
    }

    #[test]
    fn broken_rule_keeps_its_slot() {
        let policy = ApprovalPolicy::from_yaml(
            r#"
rules:
  - name: bad-regex
    when: { field: subject, matches: "([" }
    require: false
  - name: everything
    when: { keywords: [""] }
    require: false
"#,
        )
        .unwrap();
        assert!(!policy.rules()[0].is_valid());
        let err = policy.evaluate(&Subject::from_record(&mail("a@b.com"))).unwrap_err();
        assert!(matches!(err, PolicyError::Evaluation { rule, .. } if rule == "bad-regex"));
    }

    #[test]
    fn unknown_condition_invalidates_rule() {
        let policy = ApprovalPolicy::from_yaml(
            r#"
rules:
  - name: typo
    when: { new_contakt: true }
    require: false
"#,
        )
        .unwrap();
        assert!(!policy.rules()[0].is_valid());
    }

    #[test]
    fn field_regex_and_keywords() {
        let policy = ApprovalPolicy::from_yaml(
            r#"
rules:
  - name: legal
    when: { keywords: [contract] }
    require: true
  - name: internal-subject
    when: { field: subject, matches: "(?i)^\\[internal\\]" }
    require: false
"#,
        )
        .unwrap();
        let contract = mail("a@b.com").with_body("Please sign the Contract");
        assert!(policy.evaluate(&Subject::from_record(&contract)).unwrap().requires_approval());

        let internal = mail("a@b.com").with_meta("subject", json!("[Internal] lunch"));
        assert_eq!(
            policy.evaluate(&Subject::from_record(&internal)).unwrap(),
            Verdict::Exempt {
                rule: "internal-subject".into()
            }
        );
    }

    #[test]
    fn sample_policy_parses() {
        let policy = ApprovalPolicy::from_yaml(SAMPLE_POLICY).unwrap();
        assert_eq!(policy.rules().len(), 6);
        assert!(policy.rules().iter().all(Rule::is_valid));
    }

    #[tokio::test]
    async fn store_falls_back_and_reloads() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("approval_policy.yaml");

        let store = PolicyStore::open(&path, Duration::ZERO).await;
        assert!(store.current().await.rules().is_empty());

        tokio::fs::write(&path, SAMPLE_POLICY).await.unwrap();
        assert!(store.refresh().await);
        assert_eq!(store.current().await.rules().len(), 6);

        // Same mtime, nothing to do.
        assert!(!store.refresh().await);
    }
}
