//! Configuration resolution, copying and canonical serialization

use chrono::{TimeZone, Utc};
use jetctl::consumer::{
    AckPolicy, ConfigBuilder, ConfigValidator, ConsumerConfig, ConsumerFlags, DeliverPolicy, NonInteractive,
    Prompter, Question, ReplayPolicy,
};
use jetctl::error::{ConsumerError, ConsumerResult, ErrorKind};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rstest::rstest;
use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

/// Answers from a fixed script, recording what was asked
#[derive(Default)]
struct Scripted {
    answers: HashMap<Question, String>,
    asked: Vec<Question>,
}

impl Scripted {
    fn answer(mut self, question: Question, answer: &str) -> Self {
        self.answers.insert(question, answer.to_string());
        self
    }
}

impl Prompter for Scripted {
    fn ask(&mut self, question: Question) -> ConsumerResult<String> {
        self.asked.push(question);
        match self.answers.get(&question) {
            Some(answer) => Ok(answer.clone()),
            None => NonInteractive.ask(question),
        }
    }
}

fn pull_flags(name: &str) -> ConsumerFlags {
    ConsumerFlags {
        name: Some(name.to_string()),
        pull: true,
        start_policy: Some("all".into()),
        filter_subject: Some(String::new()),
        ..Default::default()
    }
}

#[test]
fn test_file_config_bypasses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("consumer.json");
    std::fs::File::create(&path)
        .unwrap()
        .write_all(br#"{"durable_name":"x","ack_policy":"explicit"}"#)
        .unwrap();

    let flags = ConsumerFlags {
        max_ack_pending: Some(-1),
        config_file: Some(path),
        ..Default::default()
    };
    let mut prompter = Scripted::default();
    let config = ConfigBuilder::new(flags, &mut prompter).build().unwrap();

    assert_eq!(config.durable_name.as_deref(), Some("x"));
    assert_eq!(config.max_deliver, 0);
    assert_eq!(config.ack_policy, AckPolicy::Explicit);
    assert!(prompter.asked.is_empty());
}

#[test]
fn test_yaml_file_and_name_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("consumer.yaml");
    std::fs::write(&path, "durable_name: PULL\nack_policy: none\n").unwrap();

    let flags = ConsumerFlags {
        name: Some("OTHER".into()),
        config_file: Some(path.clone()),
        ..Default::default()
    };
    let err = ConfigBuilder::new(flags, &mut NonInteractive).build().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Input);
    assert!(err.to_string().contains("does not match"));

    let flags = ConsumerFlags {
        config_file: Some(path),
        ..Default::default()
    };
    let trusted = ConfigBuilder::new(flags.clone(), &mut NonInteractive).build().unwrap();
    assert_eq!(trusted.ack_policy, AckPolicy::None);

    let normalized = ConfigBuilder::new(flags, &mut NonInteractive)
        .normalize_file_configs(true)
        .build()
        .unwrap();
    assert_eq!(normalized.ack_policy, AckPolicy::Explicit);
}

#[rstest]
#[case("all", DeliverPolicy::All)]
#[case("new", DeliverPolicy::New)]
#[case("next", DeliverPolicy::New)]
#[case("last", DeliverPolicy::Last)]
#[case("1024", DeliverPolicy::ByStartSequence(1024))]
#[case("1h", DeliverPolicy::ByStartTime(Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap()))]
fn test_start_policy_tokens(#[case] token: &str, #[case] expected: DeliverPolicy) {
    let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let flags = ConsumerFlags {
        start_policy: Some(token.to_string()),
        ..pull_flags("PULL")
    };
    let config = ConfigBuilder::new(flags, &mut NonInteractive).at(now).build().unwrap();
    assert_eq!(config.deliver_policy, expected);
}

#[rstest]
#[case("yesterday")]
#[case("1x")]
#[case("-5")]
fn test_unknown_start_tokens_fail(#[case] token: &str) {
    let flags = ConsumerFlags {
        start_policy: Some(token.to_string()),
        ..pull_flags("PULL")
    };
    let err = ConfigBuilder::new(flags, &mut NonInteractive).build().unwrap_err();
    assert!(matches!(err, ConsumerError::Input(_)), "{}", err);
}

#[test]
fn test_interactive_push_consumer() {
    let flags = ConsumerFlags {
        name: Some("MONITOR".into()),
        ..Default::default()
    };
    let mut prompter = Scripted::default()
        .answer(Question::DeliverySubject, "monitor.orders")
        .answer(Question::StartPolicy, "last")
        .answer(Question::AckPolicy, "all")
        .answer(Question::ReplayPolicy, "original")
        .answer(Question::FilterSubject, "orders.eu")
        .answer(Question::MaxDeliver, "5")
        .answer(Question::MaxAckPending, "-1");

    let config = ConfigBuilder::new(flags, &mut prompter).build().unwrap();

    assert_eq!(
        config,
        ConsumerConfig {
            durable_name: Some("MONITOR".into()),
            deliver_subject: Some("monitor.orders".into()),
            filter_subject: Some("orders.eu".into()),
            deliver_policy: DeliverPolicy::Last,
            ack_policy: AckPolicy::All,
            ack_wait: Duration::ZERO,
            replay_policy: ReplayPolicy::Original,
            max_deliver: 5,
            max_ack_pending: 0,
            rate_limit_bps: 0,
            sample_frequency: None,
        }
    );
    assert_eq!(prompter.asked.len(), 7);
}

#[test]
fn test_pull_mode_overrides_ack_flag() {
    let flags = ConsumerFlags {
        ack_policy: Some("none".into()),
        max_deliver: Some(3),
        ..pull_flags("PULL")
    };
    let config = ConfigBuilder::new(flags, &mut NonInteractive).build().unwrap();
    assert_eq!(config.ack_policy, AckPolicy::Explicit);
    assert_eq!(config.max_deliver, 3);
}

#[test]
fn test_rate_limit_on_pull_always_rejected() {
    let flags = ConsumerFlags {
        rate_limit_bps: Some(1_000_000),
        ..pull_flags("PULL")
    };
    let err = ConfigBuilder::new(flags, &mut NonInteractive).build().unwrap_err();
    assert_eq!(err.to_string(), "rate limits are only possible on Push consumers");

    let source = ConsumerConfig {
        durable_name: Some("SRC".into()),
        ..Default::default()
    };
    let flags = ConsumerFlags {
        rate_limit_bps: Some(1_000_000),
        ..Default::default()
    };
    assert!(ConfigBuilder::new(flags, &mut NonInteractive)
        .copy_from(&source, "DST")
        .is_err());
}

#[test]
fn test_built_configs_pass_validation() {
    let config = ConfigBuilder::new(pull_flags("PULL"), &mut NonInteractive).build().unwrap();
    let report = ConfigValidator::default().validate(&config).unwrap();
    assert!(report.valid, "{:?}", report.errors);
}

fn policy() -> impl Strategy<Value = DeliverPolicy> {
    prop_oneof![
        Just(DeliverPolicy::All),
        Just(DeliverPolicy::Last),
        Just(DeliverPolicy::New),
        Just(DeliverPolicy::LastPerSubject),
        (1u64..1_000_000).prop_map(DeliverPolicy::ByStartSequence),
        (0i64..4_000_000_000, 0u32..1_000_000_000)
            .prop_map(|(s, n)| DeliverPolicy::ByStartTime(Utc.timestamp_opt(s, n).unwrap())),
    ]
}

fn ack() -> impl Strategy<Value = AckPolicy> {
    prop_oneof![Just(AckPolicy::None), Just(AckPolicy::All), Just(AckPolicy::Explicit)]
}

prop_compose! {
    fn config()(
        durable in proptest::option::of("[A-Z][A-Z0-9_]{0,11}"),
        deliver in proptest::option::of("[a-z]{1,6}(\\.[a-z]{1,6}){0,2}"),
        filter in proptest::option::of("[a-z]{1,6}\\.(\\*|>|[a-z]{1,6})"),
        deliver_policy in policy(),
        ack_policy in ack(),
        ack_wait in 0u64..3_600_000_000_000,
        replay in prop_oneof![Just(ReplayPolicy::Instant), Just(ReplayPolicy::Original)],
        max_deliver in -1i64..100,
        max_ack_pending in 0i64..100_000,
        rate in 0u64..10_000_000,
        sample in proptest::option::of(1u8..=100),
    ) -> ConsumerConfig {
        ConsumerConfig {
            durable_name: durable,
            deliver_subject: deliver,
            filter_subject: filter,
            deliver_policy,
            ack_policy,
            ack_wait: Duration::from_nanos(ack_wait),
            replay_policy: replay,
            max_deliver,
            max_ack_pending,
            rate_limit_bps: rate,
            sample_frequency: sample,
        }
    }
}

proptest! {
    #[test]
    fn prop_canonical_serialization_is_idempotent(cfg in config()) {
        let first = cfg.to_canonical_json().unwrap();
        let parsed = ConsumerConfig::from_json(&first).unwrap();
        prop_assert_eq!(&parsed, &cfg);
        prop_assert_eq!(parsed.to_canonical_json().unwrap(), first);
    }

    #[test]
    fn prop_ack_none_means_unlimited_deliveries(max_deliver in -10i64..1000, ask in any::<bool>()) {
        let flags = ConsumerFlags {
            ack_policy: Some("none".into()),
            deliver_subject: Some("out".into()),
            max_deliver: if ask { None } else { Some(max_deliver) },
            ..pull_flags("PUSH")
        };
        let flags = ConsumerFlags { pull: false, ..flags };
        let config = ConfigBuilder::new(flags, &mut NonInteractive).build().unwrap();
        prop_assert_eq!(config.max_deliver, -1);
    }

    #[test]
    fn prop_copy_changes_only_the_overridden_field(cfg in config(), wait in 1u64..1_000_000_000) {
        let flags = ConsumerFlags {
            ack_wait: Some(Duration::from_nanos(wait)),
            ..Default::default()
        };
        let destination = cfg.durable_name.clone().unwrap_or_default();
        let result = ConfigBuilder::new(flags, &mut NonInteractive).copy_from(&cfg, &destination);

        // pull mode ephemerals are refused no matter what changed
        if cfg.is_pull_mode() && cfg.is_ephemeral() || cfg.is_pull_mode() && cfg.rate_limit_bps > 0 {
            prop_assert!(result.is_err());
        } else {
            let copy = result.unwrap();
            prop_assert_eq!(copy.ack_wait, Duration::from_nanos(wait));
            prop_assert_eq!(ConsumerConfig { ack_wait: cfg.ack_wait, ..copy }, cfg);
        }
    }
}
