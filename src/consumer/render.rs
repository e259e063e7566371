//! Operator facing output
//!
//! Everything here writes to a caller supplied [`Write`], never through the
//! logger.

use crate::broker::{ClusterInfo, ConsumerInfo, Message};
use crate::consumer::config::{AckPolicy, ConsumerConfig, DeliverPolicy};
use crate::error::ConsumerResult;
use chrono::Local;
use comfy_table::{presets::UTF8_FULL_CONDENSED, ContentArrangement, Table};
use std::io::Write;
use std::time::Duration;

/// Where a message was received, which changes the fallback header line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Pulled with a next message request
    Pulled,
    /// Pushed to a subscription
    Pushed,
}

/// Format a duration compactly, `1d2h3m4s` or `250ms`
pub fn humanize_duration(d: Duration) -> String {
    if d < Duration::from_secs(1) {
        return format!("{}ms", d.as_millis());
    }

    let mut secs = d.as_secs();
    let mut out = String::new();
    for (unit, size) in [("d", 86_400), ("h", 3_600), ("m", 60)] {
        if secs >= size {
            out.push_str(&format!("{}{}", secs / size, unit));
            secs %= size;
        }
    }
    if secs > 0 || out.is_empty() {
        out.push_str(&format!("{}s", secs));
    }
    out
}

/// Thousands separated integer
pub fn comma(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    if n < 0 {
        out.insert(0, '-');
    }
    out
}

/// Binary byte size, `1.5 KiB`
pub fn ibytes(n: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if n < 1024 {
        return format!("{} B", n);
    }
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Render a received message
///
/// Raw mode writes the body only.
pub fn message(out: &mut dyn Write, msg: &Message, delivery: Delivery, raw: bool) -> ConsumerResult<()> {
    let body = String::from_utf8_lossy(&msg.payload);
    if raw {
        writeln!(out, "{}", body)?;
        return Ok(());
    }

    let now = Local::now().format("%H:%M:%S");
    match (msg.metadata(), delivery) {
        (Some(meta), _) => writeln!(
            out,
            "[{}] subj: {} / tries: {} / cons seq: {} / str seq: {} / pending: {}",
            now, msg.subject, meta.delivered, meta.consumer_sequence, meta.stream_sequence, meta.pending
        )?,
        (None, Delivery::Pulled) => match &msg.reply {
            Some(reply) => writeln!(out, "--- subject: {} reply: {}", msg.subject, reply)?,
            None => writeln!(out, "--- subject: {}", msg.subject)?,
        },
        (None, Delivery::Pushed) => writeln!(
            out,
            "[{}] {} reply: {}",
            now,
            msg.subject,
            msg.reply.as_deref().unwrap_or("")
        )?,
    }

    if !msg.headers.is_empty() {
        writeln!(out)?;
        writeln!(out, "Headers:")?;
        writeln!(out)?;
        for (name, value) in &msg.headers {
            writeln!(out, "  {}: {}", name, value)?;
        }
        writeln!(out)?;
        writeln!(out, "Data:")?;
    }

    writeln!(out)?;
    writeln!(out, "{}", body)?;
    if !body.ends_with('\n') {
        writeln!(out)?;
    }
    Ok(())
}

fn configuration(out: &mut dyn Write, config: &ConsumerConfig) -> ConsumerResult<()> {
    writeln!(out, "Configuration:")?;
    writeln!(out)?;
    if let Some(name) = &config.durable_name {
        writeln!(out, "        Durable Name: {}", name)?;
    }
    match &config.deliver_subject {
        Some(subject) => writeln!(out, "    Delivery Subject: {}", subject)?,
        None => writeln!(out, "           Pull Mode: true")?,
    }
    if let Some(filter) = &config.filter_subject {
        writeln!(out, "      Filter Subject: {}", filter)?;
    }
    match config.deliver_policy {
        DeliverPolicy::All => writeln!(out, "         Deliver All: true")?,
        DeliverPolicy::Last => writeln!(out, "        Deliver Last: true")?,
        DeliverPolicy::New => writeln!(out, "        Deliver Next: true")?,
        DeliverPolicy::LastPerSubject => writeln!(out, "    Deliver Last Per Subject: true")?,
        DeliverPolicy::ByStartSequence(seq) => writeln!(out, "      Start Sequence: {}", seq)?,
        DeliverPolicy::ByStartTime(t) => {
            writeln!(out, "          Start Time: {}", t.with_timezone(&Local).to_rfc3339())?
        }
    }
    writeln!(out, "          Ack Policy: {}", config.ack_policy)?;
    if config.ack_policy != AckPolicy::None {
        writeln!(out, "            Ack Wait: {}", humanize_duration(config.ack_wait))?;
    }
    writeln!(out, "       Replay Policy: {}", config.replay_policy)?;
    if config.max_deliver != -1 {
        writeln!(out, "  Maximum Deliveries: {}", config.max_deliver)?;
    }
    if let Some(pct) = config.sample_frequency {
        writeln!(out, "       Sampling Rate: {}%", pct)?;
    }
    if config.rate_limit_bps > 0 {
        writeln!(out, "          Rate Limit: {} / second", ibytes(config.rate_limit_bps / 8))?;
    }
    if config.max_ack_pending > 0 {
        writeln!(out, "     Max Ack Pending: {}", comma(config.max_ack_pending))?;
    }
    writeln!(out)?;
    Ok(())
}

fn cluster(out: &mut dyn Write, cluster: &ClusterInfo) -> ConsumerResult<()> {
    writeln!(out, "Cluster Information:")?;
    writeln!(out)?;
    writeln!(out, "                Name: {}", cluster.name.as_deref().unwrap_or(""))?;
    writeln!(out, "              Leader: {}", cluster.leader)?;
    for replica in &cluster.replicas {
        let since = if replica.active.is_zero() {
            "not seen".to_string()
        } else {
            format!("seen {} ago", humanize_duration(replica.active))
        };
        let status = if replica.current { "current" } else { "outdated" };
        writeln!(out, "             Replica: {}, {}, {}", replica.name, status, since)?;
    }
    writeln!(out)?;
    Ok(())
}

/// Render configuration, cluster membership and state of a consumer
pub fn consumer_info(out: &mut dyn Write, info: &ConsumerInfo) -> ConsumerResult<()> {
    writeln!(
        out,
        "Information for Consumer {} > {} created {}",
        info.stream_name,
        info.name,
        info.created.with_timezone(&Local).to_rfc3339()
    )?;
    writeln!(out)?;
    configuration(out, &info.config)?;

    if let Some(c) = info.cluster.as_ref().filter(|c| c.name.is_some()) {
        cluster(out, c)?;
    }

    writeln!(out, "State:")?;
    writeln!(out)?;
    writeln!(
        out,
        "   Last Delivered Message: Consumer sequence: {} Stream sequence: {}",
        info.delivered.consumer_seq, info.delivered.stream_seq
    )?;
    writeln!(
        out,
        "     Acknowledgment floor: Consumer sequence: {} Stream sequence: {}",
        info.ack_floor.consumer_seq, info.ack_floor.stream_seq
    )?;
    if info.config.max_ack_pending > 0 {
        writeln!(
            out,
            "         Outstanding Acks: {} out of maximum {}",
            info.num_ack_pending, info.config.max_ack_pending
        )?;
    } else {
        writeln!(out, "         Outstanding Acks: {}", info.num_ack_pending)?;
    }
    writeln!(out, "     Redelivered Messages: {}", info.num_redelivered)?;
    if info.config.is_pull_mode() {
        writeln!(out, "    Waiting Pull Requests: {}", info.num_waiting)?;
    }
    writeln!(out, "     Unprocessed Messages: {}", info.num_pending)?;
    writeln!(out)?;
    Ok(())
}

/// Consumer names of a stream
pub fn consumer_list(out: &mut dyn Write, stream: &str, names: &[String]) -> ConsumerResult<()> {
    if names.is_empty() {
        writeln!(out, "No Consumers defined")?;
        return Ok(());
    }
    writeln!(out, "Consumers for Stream {}:", stream)?;
    writeln!(out)?;
    for name in names {
        writeln!(out, "\t{}", name)?;
    }
    writeln!(out)?;
    Ok(())
}

/// Leader marked with `*`, outdated replicas with `!`
pub fn cluster_summary(cluster: Option<&ClusterInfo>) -> String {
    let Some(cluster) = cluster else {
        return String::new();
    };
    let mut peers = vec![format!("{}*", cluster.leader)];
    let mut replicas: Vec<String> = cluster
        .replicas
        .iter()
        .map(|r| {
            if r.current {
                r.name.clone()
            } else {
                format!("{}!", r.name)
            }
        })
        .collect();
    replicas.sort();
    peers.extend(replicas);
    peers.join(", ")
}

/// Per consumer report
pub fn report_table(stream_messages: u64, rows: &[ConsumerInfo], raw: bool) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        "Consumer",
        "Mode",
        "Ack Policy",
        "Ack Wait",
        "Ack Pending",
        "Redelivered",
        "Unprocessed",
        "Ack Floor",
        "Cluster",
    ]);

    for info in rows {
        let mode = if info.config.is_pull_mode() { "Pull" } else { "Push" };
        let cluster = cluster_summary(info.cluster.as_ref());
        if raw {
            table.add_row(vec![
                info.name.clone(),
                mode.to_string(),
                info.config.ack_policy.to_string(),
                format!("{:?}", info.config.ack_wait),
                info.num_ack_pending.to_string(),
                info.num_redelivered.to_string(),
                info.num_pending.to_string(),
                info.ack_floor.stream_seq.to_string(),
                cluster,
            ]);
            continue;
        }

        let unprocessed = if info.num_pending > 0 && stream_messages > 0 {
            format!(
                "{} / {:.0}%",
                comma(info.num_pending as i64),
                info.num_pending as f64 / stream_messages as f64 * 100.0
            )
        } else {
            comma(info.num_pending as i64)
        };
        table.add_row(vec![
            info.name.clone(),
            mode.to_string(),
            info.config.ack_policy.to_string(),
            humanize_duration(info.config.ack_wait),
            comma(info.num_ack_pending as i64),
            comma(info.num_redelivered as i64),
            unprocessed,
            comma(info.ack_floor.stream_seq as i64),
            cluster,
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{PeerInfo, SequenceInfo};
    use chrono::Utc;
    use rstest::rstest;

    #[rstest]
    #[case(Duration::from_millis(250), "250ms")]
    #[case(Duration::from_secs(0), "0ms")]
    #[case(Duration::from_secs(30), "30s")]
    #[case(Duration::from_secs(90), "1m30s")]
    #[case(Duration::from_secs(86_400 + 7_200), "1d2h")]
    fn test_humanize_duration(#[case] d: Duration, #[case] expected: &str) {
        assert_eq!(humanize_duration(d), expected);
    }

    #[rstest]
    #[case(0, "0")]
    #[case(999, "999")]
    #[case(1000, "1,000")]
    #[case(1234567, "1,234,567")]
    #[case(-4200, "-4,200")]
    fn test_comma(#[case] n: i64, #[case] expected: &str) {
        assert_eq!(comma(n), expected);
    }

    #[test]
    fn test_ibytes() {
        assert_eq!(ibytes(512), "512 B");
        assert_eq!(ibytes(1536), "1.5 KiB");
        assert_eq!(ibytes(1024 * 1024), "1.0 MiB");
    }

    fn text(f: impl FnOnce(&mut Vec<u8>)) -> String {
        let mut buf = Vec::new();
        f(&mut buf);
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_message_with_metadata() {
        let msg = Message::new("orders.new", "hello")
            .with_reply("$JS.ACK.ORDERS.NEW.1.42.7.1700000000000000000.3")
            .with_header("Trace-Id", "abc");
        let out = text(|buf| message(buf, &msg, Delivery::Pulled, false).unwrap());
        assert!(out.contains("subj: orders.new / tries: 1 / cons seq: 7 / str seq: 42 / pending: 3"));
        assert!(out.contains("Headers:\n\n  Trace-Id: abc\n\nData:\n\nhello\n"));
    }

    #[test]
    fn test_message_fallbacks() {
        let msg = Message::new("plain", "x");
        let pulled = text(|buf| message(buf, &msg, Delivery::Pulled, false).unwrap());
        assert!(pulled.starts_with("--- subject: plain\n"));

        let msg = msg.with_reply("_INBOX.1");
        let pushed = text(|buf| message(buf, &msg, Delivery::Pushed, false).unwrap());
        assert!(pushed.contains("] plain reply: _INBOX.1\n"));

        let raw = text(|buf| message(buf, &msg, Delivery::Pushed, true).unwrap());
        assert_eq!(raw, "x\n");
    }

    fn info() -> ConsumerInfo {
        ConsumerInfo {
            stream_name: "ORDERS".into(),
            name: "NEW".into(),
            created: Utc::now(),
            config: ConsumerConfig {
                durable_name: Some("NEW".into()),
                ack_wait: Duration::from_secs(30),
                max_deliver: -1,
                max_ack_pending: 2000,
                ..Default::default()
            },
            delivered: SequenceInfo {
                consumer_seq: 10,
                stream_seq: 12,
            },
            ack_floor: SequenceInfo::default(),
            num_ack_pending: 3,
            num_redelivered: 1,
            num_waiting: 0,
            num_pending: 25,
            cluster: Some(ClusterInfo {
                name: Some("east".into()),
                leader: "n1".into(),
                replicas: vec![
                    PeerInfo {
                        name: "n3".into(),
                        current: false,
                        active: Duration::ZERO,
                    },
                    PeerInfo {
                        name: "n2".into(),
                        current: true,
                        active: Duration::from_secs(2),
                    },
                ],
            }),
        }
    }

    #[test]
    fn test_consumer_info_blocks() {
        let out = text(|buf| consumer_info(buf, &info()).unwrap());
        assert!(out.contains("           Pull Mode: true"));
        assert!(out.contains("            Ack Wait: 30s"));
        assert!(!out.contains("Maximum Deliveries"));
        assert!(out.contains("     Max Ack Pending: 2,000"));
        assert!(out.contains("             Replica: n3, outdated, not seen"));
        assert!(out.contains("             Replica: n2, current, seen 2s ago"));
        assert!(out.contains("         Outstanding Acks: 3 out of maximum 2000"));
        assert!(out.contains("     Unprocessed Messages: 25"));
    }

    #[test]
    fn test_list_and_report() {
        let empty = text(|buf| consumer_list(buf, "ORDERS", &[]).unwrap());
        assert_eq!(empty, "No Consumers defined\n");

        assert_eq!(cluster_summary(info().cluster.as_ref()), "n1*, n2, n3!");

        let table = report_table(100, &[info()], false).to_string();
        assert!(table.contains("25 / 25%"));
        assert!(table.contains("Pull"));
    }
}
