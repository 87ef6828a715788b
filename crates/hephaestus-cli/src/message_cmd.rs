//! `send` and `inbox`: publishing and reading envelopes from the shell.

use std::io::{self, Read, Write};

use tracing::warn;

use hephaestus_core::{AgentIdentity, MessageEnvelope, MessageType, Priority};

use crate::context::Context;
use crate::output::preview;

/// Publish one envelope. `body` of `-` reads stdin. The priority defaults to
/// the one the message type carries.
pub fn send(
    ctx: &Context,
    from: AgentIdentity,
    to: AgentIdentity,
    kind: MessageType,
    priority: Option<Priority>,
    body: String,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    ctx.require_initialized()?;
    let body = if body == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        body
    };
    let envelope = match kind {
        MessageType::Task => MessageEnvelope::task(from, to, body),
        MessageType::Status => MessageEnvelope::status(from, to, body),
        MessageType::Result => MessageEnvelope::result(from, to, body),
        MessageType::Error => MessageEnvelope::error(from, to, body),
    };
    let envelope = match priority {
        Some(priority) => envelope.with_priority(priority),
        None => envelope,
    };
    let sent = ctx.messages().publish(envelope)?;
    writeln!(out, "Sent {} to {} ({}/{})", sent.id, sent.to, sent.kind, sent.priority)?;
    Ok(())
}

/// Print envelopes addressed to `identity` newer than `since`
/// (microseconds), oldest first, followed by the watermark to resume from.
pub fn inbox(
    ctx: &Context,
    identity: AgentIdentity,
    since: i64,
    limit: Option<usize>,
    full: bool,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    ctx.require_initialized()?;
    let mut subscription = ctx.messages().subscribe(identity, since)?;
    let mut shown = 0;
    for envelope in subscription.by_ref().take(limit.unwrap_or(usize::MAX)) {
        shown += 1;
        writeln!(
            out,
            "[{}] {} -> {} ({}/{}) {}",
            envelope.timestamp, envelope.from, envelope.to, envelope.kind, envelope.priority, envelope.id
        )?;
        if full {
            for line in envelope.body.lines() {
                writeln!(out, "    {line}")?;
            }
        } else {
            writeln!(out, "    {}", preview(&envelope.body, 100))?;
        }
    }
    if !subscription.skipped().is_empty() {
        warn!(skipped = subscription.skipped().len(), agent = %identity, "Corrupt envelopes skipped");
    }
    if shown == 0 {
        writeln!(out, "No new messages for {identity}.")?;
    }
    writeln!(out, "watermark: {}", subscription.watermark())?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::context::test_support::{initialized, output};

    #[test]
    fn send_then_read_inbox() {
        let (_dir, ctx) = initialized();
        let w1 = AgentIdentity::worker(1).unwrap();
        let mut buf = Vec::new();
        send(
            &ctx,
            AgentIdentity::coordinator(),
            w1,
            MessageType::Task,
            None,
            "implement the lexer\nsee notes".into(),
            &mut buf,
        )
        .unwrap();
        let sent = output(buf);
        assert!(sent.starts_with("Sent "));
        assert!(sent.contains("to worker-1 (task/medium)"));

        let mut buf = Vec::new();
        inbox(&ctx, w1, 0, None, false, &mut buf).unwrap();
        let text = output(buf);
        assert!(text.contains("coordinator -> worker-1 (task/medium)"));
        assert!(text.contains("    implement the lexer"));
        assert!(!text.contains("see notes"));

        let watermark: i64 = text
            .lines()
            .last()
            .unwrap()
            .strip_prefix("watermark: ")
            .unwrap()
            .parse()
            .unwrap();
        let mut buf = Vec::new();
        inbox(&ctx, w1, watermark, None, true, &mut buf).unwrap();
        assert!(output(buf).starts_with("No new messages for worker-1."));
    }

    #[test]
    fn priority_override() {
        let (_dir, ctx) = initialized();
        let mut buf = Vec::new();
        send(
            &ctx,
            AgentIdentity::worker(2).unwrap(),
            AgentIdentity::coordinator(),
            MessageType::Status,
            Some(Priority::High),
            "blocked on review".into(),
            &mut buf,
        )
        .unwrap();
        assert!(output(buf).contains("(status/high)"));
    }
}
