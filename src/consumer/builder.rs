//! Resolution of a complete consumer configuration from partial input
//!
//! Values come from, in order of priority, a configuration file (which
//! bypasses everything else), explicit flags, and finally a [`Prompter`]
//! for anything still unresolved. The builder never knows whether a
//! prompter is a terminal, a script or a test double.

use crate::consumer::config::{parse_sample_frequency, AckPolicy, ConsumerConfig};
use crate::consumer::policy::parse_start_policy;
use crate::error::{ConsumerError, ConsumerResult};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

static ILLEGAL_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.*>]").expect("valid regex"));

/// Reject durable names containing `.`, `*` or `>`
pub fn validate_durable_name(name: &str) -> ConsumerResult<()> {
    if ILLEGAL_NAME.is_match(name) {
        return Err(ConsumerError::input("durable name can not contain '.', '*', '>'"));
    }
    Ok(())
}

/// Questions the builder asks when flags leave a field open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Question {
    /// Durable consumer name
    DurableName,
    /// Push delivery subject, blank for pull
    DeliverySubject,
    /// Start policy token
    StartPolicy,
    /// Acknowledgement policy
    AckPolicy,
    /// Replay policy
    ReplayPolicy,
    /// Subject filter, blank for all
    FilterSubject,
    /// Maximum delivery attempts
    MaxDeliver,
    /// Maximum outstanding acknowledgements
    MaxAckPending,
}

impl Question {
    /// Short prompt text
    pub fn message(&self) -> &'static str {
        match self {
            Question::DurableName => "Consumer name",
            Question::DeliverySubject => "Delivery target",
            Question::StartPolicy => "Start policy (all, new, last, 1h, msg sequence)",
            Question::AckPolicy => "Acknowledgement policy",
            Question::ReplayPolicy => "Replay policy",
            Question::FilterSubject => "Filter Stream by subject (blank for all)",
            Question::MaxDeliver => "Maximum Allowed Deliveries",
            Question::MaxAckPending => "Maximum Acknowledgements Pending",
        }
    }

    /// Longer explanation shown on request
    pub fn help(&self) -> &'static str {
        match self {
            Question::DurableName => {
                "Name of the durable subscription, used when referencing this Consumer later. Settable using the consumer argument"
            }
            Question::DeliverySubject => {
                "Push Consumers dispatch messages in real time to this subject. Leaving this blank creates a Pull Consumer. Settable using --target and --pull"
            }
            Question::StartPolicy => {
                "Where the Consumer starts: all messages, only the last, only new ones, a stream sequence or a time delta. Settable using --deliver"
            }
            Question::AckPolicy => {
                "'none' delivers every message once, 'all' acknowledges every earlier message too, 'explicit' needs each acknowledged. Settable using --ack"
            }
            Question::ReplayPolicy => {
                "Replay as fast as possible or at the rate messages originally arrived. Settable using --replay"
            }
            Question::FilterSubject => {
                "Deliver only messages on this subject out of all the subjects the Stream holds. Settable using --filter"
            }
            Question::MaxDeliver => {
                "-1 redelivers unacknowledged messages forever, above 0 limits delivery attempts. Settable using --max-deliver"
            }
            Question::MaxAckPending => {
                "Delivery is suspended once this many messages are awaiting acknowledgement, 0 for unlimited. Settable using --max-pending"
            }
        }
    }

    /// Choices for select style questions
    pub fn options(&self) -> Option<&'static [&'static str]> {
        match self {
            Question::AckPolicy => Some(&["explicit", "all", "none"]),
            Question::ReplayPolicy => Some(&["instant", "original"]),
            _ => None,
        }
    }

    /// Answer used when the user accepts the default
    pub fn default_answer(&self) -> Option<&'static str> {
        match self {
            Question::AckPolicy => Some("none"),
            Question::ReplayPolicy => Some("instant"),
            Question::DeliverySubject | Question::FilterSubject => Some(""),
            Question::MaxDeliver => Some("-1"),
            Question::MaxAckPending => Some("0"),
            Question::DurableName | Question::StartPolicy => None,
        }
    }

    /// Whether a blank answer is refused
    pub fn required(&self) -> bool {
        matches!(self, Question::DurableName | Question::StartPolicy)
    }

    /// Flag that supplies the same value
    pub fn flag(&self) -> &'static str {
        match self {
            Question::DurableName => "the consumer argument",
            Question::DeliverySubject => "--target or --pull",
            Question::StartPolicy => "--deliver",
            Question::AckPolicy => "--ack",
            Question::ReplayPolicy => "--replay",
            Question::FilterSubject => "--filter",
            Question::MaxDeliver => "--max-deliver",
            Question::MaxAckPending => "--max-pending",
        }
    }
}

/// Source of answers for fields not supplied as flags
#[cfg_attr(test, mockall::automock)]
pub trait Prompter {
    /// Answer a question
    fn ask(&mut self, question: Question) -> ConsumerResult<String>;

    /// Pick one of `options`, a list of stream or consumer names
    fn choose(&mut self, what: &str, options: &[String]) -> ConsumerResult<String> {
        let _ = options;
        Err(ConsumerError::input(format!("{} name is required", what)))
    }
}

/// Prompter for unattended runs: takes declared defaults and refuses the rest
#[derive(Debug, Default, Clone, Copy)]
pub struct NonInteractive;

impl Prompter for NonInteractive {
    fn ask(&mut self, question: Question) -> ConsumerResult<String> {
        question.default_answer().map(str::to_string).ok_or_else(|| {
            ConsumerError::input(format!(
                "{} is required, supply it using {}",
                question.message(),
                question.flag()
            ))
        })
    }
}

/// Flags and arguments supplied on the command line
#[derive(Debug, Clone, Default)]
pub struct ConsumerFlags {
    /// Consumer name argument
    pub name: Option<String>,
    /// Create an ephemeral consumer
    pub ephemeral: bool,
    /// Pull mode
    pub pull: bool,
    /// Push delivery subject
    pub deliver_subject: Option<String>,
    /// Subject filter, `Some("")` means explicitly unfiltered
    pub filter_subject: Option<String>,
    /// Start policy token
    pub start_policy: Option<String>,
    /// Acknowledgement policy name
    pub ack_policy: Option<String>,
    /// Replay policy name
    pub replay_policy: Option<String>,
    /// Acknowledgement wait
    pub ack_wait: Option<Duration>,
    /// Sample percentage
    pub sample_pct: Option<i64>,
    /// Maximum delivery attempts
    pub max_deliver: Option<i64>,
    /// Maximum outstanding acknowledgements
    pub max_ack_pending: Option<i64>,
    /// Rate limit in bits per second
    pub rate_limit_bps: Option<u64>,
    /// Configuration file that replaces all other input
    pub config_file: Option<PathBuf>,
}

/// Builds validated consumer configurations
pub struct ConfigBuilder<'p> {
    flags: ConsumerFlags,
    prompter: &'p mut dyn Prompter,
    normalize_file_configs: bool,
    now: DateTime<Utc>,
}

impl<'p> ConfigBuilder<'p> {
    /// Create a builder over the given flags and prompter
    pub fn new(flags: ConsumerFlags, prompter: &'p mut dyn Prompter) -> Self {
        Self {
            flags,
            prompter,
            normalize_file_configs: false,
            now: Utc::now(),
        }
    }

    /// Apply pull mode and ack policy normalization to file configurations too
    pub fn normalize_file_configs(mut self, normalize: bool) -> Self {
        self.normalize_file_configs = normalize;
        self
    }

    /// Reference time for relative start policies
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    fn ask(&mut self, question: Question) -> ConsumerResult<String> {
        let answer = self.prompter.ask(question)?.trim().to_string();
        if answer.is_empty() && question.required() {
            return Err(ConsumerError::input(format!("{} is required", question.message())));
        }
        debug!(?question, %answer, "resolved by prompt");
        Ok(answer)
    }

    /// Flag value if supplied, otherwise the prompter's answer
    fn resolve(&mut self, flag: Option<String>, question: Question) -> ConsumerResult<String> {
        match flag {
            Some(value) => Ok(value),
            None => self.ask(question),
        }
    }

    fn resolve_number(&mut self, flag: Option<i64>, question: Question) -> ConsumerResult<i64> {
        if let Some(value) = flag {
            return Ok(value);
        }
        let answer = self.ask(question)?;
        if answer.is_empty() {
            return Ok(question.default_answer().and_then(|d| d.parse().ok()).unwrap_or(0));
        }
        answer.parse().map_err(|_| {
            ConsumerError::input(format!("invalid number '{}' for {}", answer, question.message()))
        })
    }

    fn sample_frequency(pct: i64) -> ConsumerResult<Option<u8>> {
        if !(0..=100).contains(&pct) {
            return Err(ConsumerError::input("sample percent is not between 0 and 100"));
        }
        Ok(u8::try_from(pct).ok().filter(|p| *p > 0))
    }

    /// Resolve a configuration for a new consumer
    pub fn build(mut self) -> ConsumerResult<ConsumerConfig> {
        if let Some(path) = self.flags.config_file.clone() {
            return self.load_file(path);
        }

        let mut cfg = ConsumerConfig::default();

        // Name
        let name = self.flags.name.clone().filter(|n| !n.is_empty());
        let name = match name {
            Some(name) => Some(name),
            None if !self.flags.ephemeral => Some(self.ask(Question::DurableName)?),
            None => None,
        };
        cfg.durable_name = if self.flags.ephemeral { None } else { name };
        if let Some(name) = &cfg.durable_name {
            validate_durable_name(name)?;
        }

        // Mode
        let delivery = if self.flags.pull {
            String::new()
        } else {
            let flag = self.flags.deliver_subject.clone().filter(|s| !s.is_empty());
            self.resolve(flag, Question::DeliverySubject)?
        };
        if self.flags.ephemeral && delivery.is_empty() {
            return Err(ConsumerError::input("ephemeral consumers must be push-based"));
        }
        cfg.deliver_subject = Some(delivery).filter(|s| !s.is_empty());

        let mut ack_token = self.flags.ack_policy.clone();
        if cfg.is_pull_mode() {
            ack_token = Some("explicit".to_string());
        }

        // Start policy
        let start = self.resolve(self.flags.start_policy.clone(), Question::StartPolicy)?;
        cfg.deliver_policy = parse_start_policy(&start, self.now)?;

        // Ack and replay policies
        let ack = self.resolve(ack_token, Question::AckPolicy)?;
        let replay = self.resolve(self.flags.replay_policy.clone(), Question::ReplayPolicy)?;
        cfg.ack_policy = ack.parse()?;
        cfg.replay_policy = replay.parse()?;
        if cfg.ack_policy == AckPolicy::None {
            cfg.max_deliver = -1;
        }

        if let Some(wait) = self.flags.ack_wait.filter(|w| !w.is_zero()) {
            cfg.ack_wait = wait;
        }

        if let Some(pct) = self.flags.sample_pct {
            cfg.sample_frequency = Self::sample_frequency(pct)?;
        }

        let filter = self.resolve(self.flags.filter_subject.clone(), Question::FilterSubject)?;
        cfg.filter_subject = Some(filter).filter(|s| !s.is_empty());

        // Delivery limits only matter when something gets acknowledged
        let acknowledged = cfg.ack_policy != AckPolicy::None;
        let max_deliver = match self.flags.max_deliver {
            Some(v) => v,
            None if acknowledged => self.resolve_number(None, Question::MaxDeliver)?,
            None => 0,
        };
        let max_ack_pending = match self.flags.max_ack_pending {
            Some(v) => v,
            None if acknowledged => self.resolve_number(None, Question::MaxAckPending)?,
            None => -1,
        };

        cfg.max_ack_pending = if max_ack_pending == -1 { 0 } else { max_ack_pending };
        if max_deliver != 0 && acknowledged {
            cfg.max_deliver = max_deliver;
        }

        let bps = self.flags.rate_limit_bps.unwrap_or(0);
        if bps > 0 && cfg.is_pull_mode() {
            return Err(ConsumerError::input("rate limits are only possible on Push consumers"));
        }
        cfg.rate_limit_bps = bps;

        Ok(cfg)
    }

    fn load_file(&self, path: PathBuf) -> ConsumerResult<ConsumerConfig> {
        let mut cfg = ConsumerConfig::from_file(&path)?;
        debug!(path = %path.display(), "loaded consumer configuration from file");

        if let (Some(durable), Some(name)) = (&cfg.durable_name, &self.flags.name) {
            if !name.is_empty() && durable != name {
                return Err(ConsumerError::input(format!(
                    "durable consumer name {} in {} does not match CLI consumer name {}",
                    durable,
                    path.display(),
                    name
                )));
            }
        }

        if self.normalize_file_configs {
            if cfg.is_pull_mode() {
                cfg.ack_policy = AckPolicy::Explicit;
            }
            if cfg.ack_policy == AckPolicy::None {
                cfg.max_deliver = -1;
            }
        }

        Ok(cfg)
    }

    /// Derive a configuration from an existing consumer
    ///
    /// Only explicitly supplied flags change the copy; an empty destination
    /// or `--ephemeral` yields an unnamed consumer.
    pub fn copy_from(self, source: &ConsumerConfig, destination: &str) -> ConsumerResult<ConsumerConfig> {
        let flags = &self.flags;
        let mut cfg = source.clone();

        if let Some(wait) = flags.ack_wait.filter(|w| !w.is_zero()) {
            cfg.ack_wait = wait;
        }

        if let Some(pct) = flags.sample_pct {
            cfg.sample_frequency = Self::sample_frequency(pct)?;
        }

        if let Some(start) = &flags.start_policy {
            cfg.deliver_policy = parse_start_policy(start, self.now)?;
        }

        cfg.durable_name = if flags.ephemeral || destination.is_empty() {
            None
        } else {
            validate_durable_name(destination)?;
            Some(destination.to_string())
        };

        if let Some(subject) = flags.deliver_subject.as_ref().filter(|s| !s.is_empty()) {
            cfg.deliver_subject = Some(subject.clone());
        }

        let mut ack_token = flags.ack_policy.clone();
        if flags.pull {
            cfg.deliver_subject = None;
            ack_token = Some("explicit".to_string());
        }

        if let Some(ack) = ack_token {
            cfg.ack_policy = ack.parse()?;
        }

        if let Some(filter) = &flags.filter_subject {
            cfg.filter_subject = Some(filter.clone()).filter(|s| !s.is_empty());
        }

        if let Some(replay) = &flags.replay_policy {
            cfg.replay_policy = replay.parse()?;
        }

        if let Some(max) = flags.max_deliver.filter(|m| *m != 0) {
            cfg.max_deliver = max;
        }

        if let Some(bps) = flags.rate_limit_bps.filter(|b| *b > 0) {
            cfg.rate_limit_bps = bps;
        }

        if let Some(pending) = flags.max_ack_pending.filter(|p| *p != -1) {
            cfg.max_ack_pending = pending;
        }

        if cfg.rate_limit_bps > 0 && cfg.is_pull_mode() {
            return Err(ConsumerError::input("rate limits are only possible on Push consumers"));
        }

        if cfg.is_ephemeral() && cfg.is_pull_mode() {
            return Err(ConsumerError::input("ephemeral consumers must be push-based"));
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::config::{DeliverPolicy, ReplayPolicy};
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;

    fn push_flags() -> ConsumerFlags {
        ConsumerFlags {
            name: Some("MONITOR".into()),
            deliver_subject: Some("monitor.orders".into()),
            filter_subject: Some(String::new()),
            start_policy: Some("all".into()),
            ack_policy: Some("explicit".into()),
            replay_policy: Some("instant".into()),
            max_deliver: Some(5),
            max_ack_pending: Some(100),
            ..Default::default()
        }
    }

    #[test]
    fn test_fully_flagged_never_prompts() {
        let mut prompter = MockPrompter::new();
        prompter.expect_ask().never();

        let cfg = ConfigBuilder::new(push_flags(), &mut prompter).build().unwrap();
        assert_eq!(cfg.durable_name.as_deref(), Some("MONITOR"));
        assert_eq!(cfg.deliver_subject.as_deref(), Some("monitor.orders"));
        assert_eq!(cfg.filter_subject, None);
        assert_eq!(cfg.ack_policy, AckPolicy::Explicit);
        assert_eq!(cfg.max_deliver, 5);
        assert_eq!(cfg.max_ack_pending, 100);
    }

    #[test]
    fn test_prompts_for_missing_name() {
        let mut prompter = MockPrompter::new();
        prompter
            .expect_ask()
            .with(eq(Question::DurableName))
            .times(1)
            .returning(|_| Ok("PROMPTED".into()));

        let flags = ConsumerFlags { name: None, ..push_flags() };
        let cfg = ConfigBuilder::new(flags, &mut prompter).build().unwrap();
        assert_eq!(cfg.durable_name.as_deref(), Some("PROMPTED"));
    }

    #[test]
    fn test_illegal_durable_names() {
        for name in ["ORDERS.NEW", "ORDERS*", "ORDERS>"] {
            let flags = ConsumerFlags { name: Some(name.into()), ..push_flags() };
            let err = ConfigBuilder::new(flags, &mut NonInteractive).build().unwrap_err();
            assert!(matches!(err, ConsumerError::Input(_)), "{} accepted", name);
        }
    }

    #[test]
    fn test_blank_delivery_answer_means_pull() {
        let mut prompter = MockPrompter::new();
        prompter
            .expect_ask()
            .with(eq(Question::DeliverySubject))
            .returning(|_| Ok(String::new()));

        let flags = ConsumerFlags {
            deliver_subject: None,
            ack_policy: Some("none".into()),
            ..push_flags()
        };
        let cfg = ConfigBuilder::new(flags, &mut prompter).build().unwrap();
        assert!(cfg.is_pull_mode());
        // pull mode overrides the requested ack policy
        assert_eq!(cfg.ack_policy, AckPolicy::Explicit);
    }

    #[test]
    fn test_ephemeral_pull_is_rejected() {
        let flags = ConsumerFlags {
            name: None,
            ephemeral: true,
            pull: true,
            ..push_flags()
        };
        let err = ConfigBuilder::new(flags, &mut NonInteractive).build().unwrap_err();
        assert_eq!(err.to_string(), "ephemeral consumers must be push-based");
    }

    #[test]
    fn test_ack_none_forces_unlimited_deliveries() {
        let flags = ConsumerFlags {
            ack_policy: Some("none".into()),
            max_deliver: Some(10),
            ..push_flags()
        };
        let cfg = ConfigBuilder::new(flags, &mut NonInteractive).build().unwrap();
        assert_eq!(cfg.max_deliver, -1);
    }

    #[test]
    fn test_defaults_from_prompter() {
        let flags = ConsumerFlags {
            name: Some("DEFAULTS".into()),
            deliver_subject: Some("out".into()),
            start_policy: Some("last".into()),
            ..Default::default()
        };
        let cfg = ConfigBuilder::new(flags, &mut NonInteractive).build().unwrap();
        assert_eq!(cfg.ack_policy, AckPolicy::None);
        assert_eq!(cfg.replay_policy, ReplayPolicy::Instant);
        assert_eq!(cfg.deliver_policy, DeliverPolicy::Last);
        assert_eq!(cfg.max_deliver, -1);
        assert_eq!(cfg.max_ack_pending, 0);
    }

    #[test]
    fn test_max_ack_pending_sentinel_normalizes() {
        let mut prompter = MockPrompter::new();
        prompter
            .expect_ask()
            .with(eq(Question::MaxAckPending))
            .returning(|_| Ok("-1".into()));

        let flags = ConsumerFlags { max_ack_pending: None, ..push_flags() };
        let cfg = ConfigBuilder::new(flags, &mut prompter).build().unwrap();
        assert_eq!(cfg.max_ack_pending, 0);
    }

    #[test]
    fn test_sample_bounds() {
        let flags = ConsumerFlags { sample_pct: Some(101), ..push_flags() };
        assert!(ConfigBuilder::new(flags, &mut NonInteractive).build().is_err());

        let flags = ConsumerFlags { sample_pct: Some(0), ..push_flags() };
        let cfg = ConfigBuilder::new(flags, &mut NonInteractive).build().unwrap();
        assert_eq!(cfg.sample_frequency, None);

        let flags = ConsumerFlags { sample_pct: Some(20), ..push_flags() };
        let cfg = ConfigBuilder::new(flags, &mut NonInteractive).build().unwrap();
        assert_eq!(cfg.sample_frequency, Some(20));
    }

    #[test]
    fn test_rate_limit_on_pull_is_rejected() {
        let flags = ConsumerFlags {
            pull: true,
            rate_limit_bps: Some(1024),
            ..push_flags()
        };
        let err = ConfigBuilder::new(flags, &mut NonInteractive).build().unwrap_err();
        assert_eq!(err.to_string(), "rate limits are only possible on Push consumers");
    }

    #[test]
    fn test_non_interactive_refuses_required_questions() {
        let flags = ConsumerFlags { start_policy: None, ..push_flags() };
        let err = ConfigBuilder::new(flags, &mut NonInteractive).build().unwrap_err();
        assert!(err.to_string().contains("--deliver"));
    }

    #[test]
    fn test_copy_changes_only_supplied_fields() {
        let source = ConfigBuilder::new(push_flags(), &mut NonInteractive).build().unwrap();
        let flags = ConsumerFlags {
            replay_policy: Some("original".into()),
            ..Default::default()
        };
        let copy = ConfigBuilder::new(flags, &mut NonInteractive)
            .copy_from(&source, "MONITOR")
            .unwrap();

        let expected = ConsumerConfig {
            replay_policy: ReplayPolicy::Original,
            ..source
        };
        assert_eq!(copy, expected);
    }

    #[test]
    fn test_copy_ignores_zero_max_deliver() {
        let source = ConsumerConfig {
            max_deliver: 20,
            ..ConfigBuilder::new(push_flags(), &mut NonInteractive).build().unwrap()
        };

        let zero = ConsumerFlags {
            max_deliver: Some(0),
            ..Default::default()
        };
        let copy = ConfigBuilder::new(zero, &mut NonInteractive)
            .copy_from(&source, "MONITOR")
            .unwrap();
        assert_eq!(copy.max_deliver, 20);

        let five = ConsumerFlags {
            max_deliver: Some(5),
            ..Default::default()
        };
        let copy = ConfigBuilder::new(five, &mut NonInteractive)
            .copy_from(&source, "MONITOR")
            .unwrap();
        assert_eq!(copy.max_deliver, 5);
    }

    #[test]
    fn test_copy_to_empty_destination_is_unnamed() {
        let source = ConfigBuilder::new(push_flags(), &mut NonInteractive).build().unwrap();
        let copy = ConfigBuilder::new(ConsumerFlags::default(), &mut NonInteractive)
            .copy_from(&source, "")
            .unwrap();
        assert!(copy.is_ephemeral());
        assert_eq!(copy.deliver_subject, source.deliver_subject);
    }
}
