//! The request/reply API surface: subject constants, router wiring, and the
//! per-endpoint handlers.
//!
//! Every handler follows the same contract: messages without an
//! authenticated account are ignored outright; accounts without JetStream
//! get `-ERR 'jetstream not enabled for account'`; malformed bodies get
//! `-ERR 'bad request'`; name tokens in the subject are cross-checked
//! against names carried in the body. Mutations reply `+OK`, info/list
//! queries reply pretty-printed JSON.

use crate::bus::{Bus, Delivery, MsgHandler};
use crate::consumer::CreateConsumerRequest;
use crate::error::{JetStreamError, Result};
use crate::ledger::Ledger;
use crate::stream::StreamConfig;
use crate::subject::token_at;
use crate::template::StreamTemplateConfig;
use serde::Serialize;
use std::fmt::Display;
use std::sync::Arc;

/// Positive reply to mutations.
pub const OK: &str = "+OK";

/// Checks whether JetStream is enabled for the requesting account.
pub const API_ENABLED: &str = "$JS.ENABLED";
/// Account usage and limits, as JSON.
pub const API_INFO: &str = "$JS.INFO";

pub const API_TEMPLATE_CREATE: &str = "$JS.TEMPLATE.*.CREATE";
pub const API_TEMPLATES_LIST: &str = "$JS.TEMPLATES.LIST";
pub const API_TEMPLATE_INFO: &str = "$JS.TEMPLATE.*.INFO";
pub const API_TEMPLATE_DELETE: &str = "$JS.TEMPLATE.*.DELETE";

pub const API_STREAM_CREATE: &str = "$JS.STREAM.*.CREATE";
pub const API_STREAM_LIST: &str = "$JS.STREAM.LIST";
pub const API_STREAM_INFO: &str = "$JS.STREAM.*.INFO";
pub const API_STREAM_DELETE: &str = "$JS.STREAM.*.DELETE";
pub const API_STREAM_PURGE: &str = "$JS.STREAM.*.PURGE";
pub const API_MSG_DELETE: &str = "$JS.STREAM.*.MSG.DELETE";

pub const API_CONSUMER_CREATE: &str = "$JS.STREAM.*.CONSUMER.*.CREATE";
pub const API_EPHEMERAL_CONSUMER_CREATE: &str = "$JS.STREAM.*.EPHEMERAL.CONSUMER.CREATE";
pub const API_CONSUMERS: &str = "$JS.STREAM.*.CONSUMERS";
pub const API_CONSUMER_INFO: &str = "$JS.STREAM.*.CONSUMER.*.INFO";
pub const API_CONSUMER_DELETE: &str = "$JS.STREAM.*.CONSUMER.*.DELETE";

/// Reserved prefix for advisory events. Nothing is published here by this
/// subsystem.
pub const ADVISORY_PREFIX: &str = "$JS.EVENT.ADVISORY";
/// Reserved prefix for metric events.
pub const METRIC_PREFIX: &str = "$JS.EVENT.METRIC";

/// Every API subject, in export/import order.
pub const ALL_ENDPOINTS: [&str; 17] = [
    API_ENABLED,
    API_INFO,
    API_TEMPLATE_CREATE,
    API_TEMPLATES_LIST,
    API_TEMPLATE_INFO,
    API_TEMPLATE_DELETE,
    API_STREAM_CREATE,
    API_STREAM_LIST,
    API_STREAM_INFO,
    API_STREAM_DELETE,
    API_STREAM_PURGE,
    API_MSG_DELETE,
    API_CONSUMER_CREATE,
    API_EPHEMERAL_CONSUMER_CREATE,
    API_CONSUMERS,
    API_CONSUMER_INFO,
    API_CONSUMER_DELETE,
];

const NOT_ENABLED: &str = "-ERR 'jetstream not enabled for account'";
const BAD_REQUEST: &str = "-ERR 'bad request'";

fn err_reply(reason: impl Display) -> Vec<u8> {
    format!("-ERR '{reason}'").into_bytes()
}

fn json_reply<T: Serialize>(value: &T) -> Option<Vec<u8>> {
    serde_json::to_vec_pretty(value).ok()
}

/// Subject token positions carrying entity names.
const NAME_TOKEN: usize = 2;
const CONSUMER_TOKEN: usize = 4;

type Handler = fn(&Arc<Ledger>, &str, Delivery<'_>) -> Option<Vec<u8>>;

/// Wires every endpoint as a system subscription against `ledger`.
pub(crate) fn subscribe_all(bus: &Arc<dyn Bus>, ledger: &Arc<Ledger>) -> Result<()> {
    let routes: [(&str, Handler); 17] = [
        (API_ENABLED, enabled_request),
        (API_INFO, account_info_request),
        (API_TEMPLATE_CREATE, template_create_request),
        (API_TEMPLATES_LIST, template_list_request),
        (API_TEMPLATE_INFO, template_info_request),
        (API_TEMPLATE_DELETE, template_delete_request),
        (API_STREAM_CREATE, stream_create_request),
        (API_STREAM_LIST, stream_list_request),
        (API_STREAM_INFO, stream_info_request),
        (API_STREAM_DELETE, stream_delete_request),
        (API_STREAM_PURGE, stream_purge_request),
        (API_MSG_DELETE, msg_delete_request),
        (API_CONSUMER_CREATE, consumer_create_request),
        (API_EPHEMERAL_CONSUMER_CREATE, ephemeral_consumer_create_request),
        (API_CONSUMERS, consumers_request),
        (API_CONSUMER_INFO, consumer_info_request),
        (API_CONSUMER_DELETE, consumer_delete_request),
    ];
    for (subject, handler) in routes {
        let weak = Arc::downgrade(ledger);
        let reply_bus = Arc::clone(bus);
        let callback: MsgHandler = Arc::new(move |delivery: Delivery<'_>| {
            let Some(ledger) = weak.upgrade() else {
                return;
            };
            // No client or unauthenticated account: ignore.
            let Some(account) = delivery.account else {
                return;
            };
            if let Some(reply) = handler(&ledger, account, delivery) {
                reply_bus.send_account_msg(account, delivery.reply, &reply);
            }
        });
        bus.sys_subscribe(subject, callback)
            .map_err(JetStreamError::Subscription)?;
    }
    Ok(())
}

fn enabled_request(ledger: &Arc<Ledger>, account: &str, _d: Delivery<'_>) -> Option<Vec<u8>> {
    Some(if ledger.lookup_account(account).is_some() {
        OK.into()
    } else {
        NOT_ENABLED.into()
    })
}

fn account_info_request(ledger: &Arc<Ledger>, account: &str, d: Delivery<'_>) -> Option<Vec<u8>> {
    let Some(jsa) = ledger.lookup_account(account) else {
        return Some(NOT_ENABLED.into());
    };
    if !d.payload.is_empty() {
        return Some(BAD_REQUEST.into());
    }
    json_reply(&jsa.usage())
}

fn template_create_request(
    ledger: &Arc<Ledger>,
    account: &str,
    d: Delivery<'_>,
) -> Option<Vec<u8>> {
    let Some(jsa) = ledger.lookup_account(account) else {
        return Some(NOT_ENABLED.into());
    };
    let Ok(cfg) = serde_json::from_slice::<StreamTemplateConfig>(d.payload) else {
        return Some(BAD_REQUEST.into());
    };
    if token_at(d.subject, NAME_TOKEN) != Some(cfg.name.as_str()) {
        return Some(err_reply("template name in subject does not match request"));
    }
    Some(match jsa.add_stream_template(cfg) {
        Ok(_) => OK.into(),
        Err(err) => err_reply(err),
    })
}

fn template_list_request(ledger: &Arc<Ledger>, account: &str, d: Delivery<'_>) -> Option<Vec<u8>> {
    let Some(jsa) = ledger.lookup_account(account) else {
        return Some(NOT_ENABLED.into());
    };
    if !d.payload.is_empty() {
        return Some(BAD_REQUEST.into());
    }
    let mut names: Vec<String> = jsa
        .templates()
        .iter()
        .map(|t| t.name().to_string())
        .collect();
    names.sort();
    json_reply(&names)
}

fn template_info_request(ledger: &Arc<Ledger>, account: &str, d: Delivery<'_>) -> Option<Vec<u8>> {
    let Some(jsa) = ledger.lookup_account(account) else {
        return Some(NOT_ENABLED.into());
    };
    if !d.payload.is_empty() {
        return Some(BAD_REQUEST.into());
    }
    let name = token_at(d.subject, NAME_TOKEN)?;
    match jsa.lookup_template(name) {
        Ok(template) => json_reply(&template.info()),
        Err(err) => Some(err_reply(err)),
    }
}

fn template_delete_request(
    ledger: &Arc<Ledger>,
    account: &str,
    d: Delivery<'_>,
) -> Option<Vec<u8>> {
    let Some(jsa) = ledger.lookup_account(account) else {
        return Some(NOT_ENABLED.into());
    };
    if !d.payload.is_empty() {
        return Some(BAD_REQUEST.into());
    }
    let name = token_at(d.subject, NAME_TOKEN)?;
    Some(match jsa.delete_stream_template(name) {
        Ok(()) => OK.into(),
        Err(err) => err_reply(err),
    })
}

fn stream_create_request(ledger: &Arc<Ledger>, account: &str, d: Delivery<'_>) -> Option<Vec<u8>> {
    let Some(jsa) = ledger.lookup_account(account) else {
        return Some(NOT_ENABLED.into());
    };
    let Ok(cfg) = serde_json::from_slice::<StreamConfig>(d.payload) else {
        return Some(BAD_REQUEST.into());
    };
    if token_at(d.subject, NAME_TOKEN) != Some(cfg.name.as_str()) {
        return Some(err_reply("stream name in subject does not match request"));
    }
    Some(match jsa.add_stream(cfg) {
        Ok(_) => OK.into(),
        Err(err) => err_reply(err),
    })
}

fn stream_list_request(ledger: &Arc<Ledger>, account: &str, d: Delivery<'_>) -> Option<Vec<u8>> {
    let Some(jsa) = ledger.lookup_account(account) else {
        return Some(NOT_ENABLED.into());
    };
    if !d.payload.is_empty() {
        return Some(BAD_REQUEST.into());
    }
    let mut names: Vec<String> = jsa
        .streams()
        .iter()
        .map(|s| s.name().to_string())
        .collect();
    names.sort();
    json_reply(&names)
}

fn stream_info_request(ledger: &Arc<Ledger>, account: &str, d: Delivery<'_>) -> Option<Vec<u8>> {
    let Some(jsa) = ledger.lookup_account(account) else {
        return Some(NOT_ENABLED.into());
    };
    if !d.payload.is_empty() {
        return Some(BAD_REQUEST.into());
    }
    let name = token_at(d.subject, NAME_TOKEN)?;
    match jsa.lookup_stream(name) {
        Ok(stream) => json_reply(&stream.info()),
        Err(err) => Some(err_reply(err)),
    }
}

fn stream_delete_request(ledger: &Arc<Ledger>, account: &str, d: Delivery<'_>) -> Option<Vec<u8>> {
    let Some(jsa) = ledger.lookup_account(account) else {
        return Some(NOT_ENABLED.into());
    };
    if !d.payload.is_empty() {
        return Some(BAD_REQUEST.into());
    }
    let name = token_at(d.subject, NAME_TOKEN)?;
    let stream = match jsa.lookup_stream(name) {
        Ok(stream) => stream,
        Err(err) => return Some(err_reply(err)),
    };
    Some(match stream.delete() {
        Ok(()) => OK.into(),
        Err(err) => err_reply(err),
    })
}

fn stream_purge_request(ledger: &Arc<Ledger>, account: &str, d: Delivery<'_>) -> Option<Vec<u8>> {
    let Some(jsa) = ledger.lookup_account(account) else {
        return Some(NOT_ENABLED.into());
    };
    if !d.payload.is_empty() {
        return Some(BAD_REQUEST.into());
    }
    let name = token_at(d.subject, NAME_TOKEN)?;
    let stream = match jsa.lookup_stream(name) {
        Ok(stream) => stream,
        Err(err) => return Some(err_reply(err)),
    };
    stream.purge();
    Some(OK.into())
}

/// Body is a decimal stream sequence. Anything unparseable behaves as
/// sequence 0 and reports not-found.
fn msg_delete_request(ledger: &Arc<Ledger>, account: &str, d: Delivery<'_>) -> Option<Vec<u8>> {
    let Some(jsa) = ledger.lookup_account(account) else {
        return Some(NOT_ENABLED.into());
    };
    if d.payload.is_empty() {
        return Some(BAD_REQUEST.into());
    }
    let name = token_at(d.subject, NAME_TOKEN)?;
    let stream = match jsa.lookup_stream(name) {
        Ok(stream) => stream,
        Err(err) => return Some(err_reply(err)),
    };
    let seq = std::str::from_utf8(d.payload)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    Some(if stream.erase_msg(seq) {
        OK.into()
    } else {
        err_reply(format_args!("sequence [{seq}] not found"))
    })
}

fn consumer_create_request(
    ledger: &Arc<Ledger>,
    account: &str,
    d: Delivery<'_>,
) -> Option<Vec<u8>> {
    let Some(jsa) = ledger.lookup_account(account) else {
        return Some(NOT_ENABLED.into());
    };
    let Ok(req) = serde_json::from_slice::<CreateConsumerRequest>(d.payload) else {
        return Some(BAD_REQUEST.into());
    };
    if token_at(d.subject, NAME_TOKEN) != Some(req.stream_name.as_str()) {
        return Some(err_reply("stream name in subject does not match request"));
    }
    let stream = match jsa.lookup_stream(&req.stream_name) {
        Ok(stream) => stream,
        Err(err) => return Some(err_reply(err)),
    };
    if !req.config.is_durable() {
        return Some(err_reply(
            "consumer expected to be durable but a durable name was not set",
        ));
    }
    if token_at(d.subject, CONSUMER_TOKEN) != req.config.durable.as_deref() {
        return Some(err_reply(
            "consumer name in subject does not match durable name in request",
        ));
    }
    Some(match stream.add_consumer(req.config) {
        Ok(_) => OK.into(),
        Err(err) => err_reply(err),
    })
}

fn ephemeral_consumer_create_request(
    ledger: &Arc<Ledger>,
    account: &str,
    d: Delivery<'_>,
) -> Option<Vec<u8>> {
    let Some(jsa) = ledger.lookup_account(account) else {
        return Some(NOT_ENABLED.into());
    };
    let Ok(req) = serde_json::from_slice::<CreateConsumerRequest>(d.payload) else {
        return Some(BAD_REQUEST.into());
    };
    if token_at(d.subject, NAME_TOKEN) != Some(req.stream_name.as_str()) {
        return Some(err_reply("stream name in subject does not match request"));
    }
    let stream = match jsa.lookup_stream(&req.stream_name) {
        Ok(stream) => stream,
        Err(err) => return Some(err_reply(err)),
    };
    if req.config.is_durable() {
        return Some(err_reply(
            "consumer expected to be ephemeral but a durable name was set",
        ));
    }
    Some(match stream.add_consumer(req.config) {
        Ok(consumer) => format!("{OK} {}", consumer.name()).into_bytes(),
        Err(err) => err_reply(err),
    })
}

fn consumers_request(ledger: &Arc<Ledger>, account: &str, d: Delivery<'_>) -> Option<Vec<u8>> {
    let Some(jsa) = ledger.lookup_account(account) else {
        return Some(NOT_ENABLED.into());
    };
    if !d.payload.is_empty() {
        return Some(BAD_REQUEST.into());
    }
    let name = token_at(d.subject, NAME_TOKEN)?;
    let stream = match jsa.lookup_stream(name) {
        Ok(stream) => stream,
        Err(err) => return Some(err_reply(err)),
    };
    let mut names: Vec<String> = stream
        .consumers()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    names.sort();
    json_reply(&names)
}

fn consumer_info_request(ledger: &Arc<Ledger>, account: &str, d: Delivery<'_>) -> Option<Vec<u8>> {
    let Some(jsa) = ledger.lookup_account(account) else {
        return Some(NOT_ENABLED.into());
    };
    if !d.payload.is_empty() {
        return Some(BAD_REQUEST.into());
    }
    let stream_name = token_at(d.subject, NAME_TOKEN)?;
    let stream = match jsa.lookup_stream(stream_name) {
        Ok(stream) => stream,
        Err(err) => return Some(err_reply(err)),
    };
    let consumer_name = token_at(d.subject, CONSUMER_TOKEN)?;
    match stream.lookup_consumer(consumer_name) {
        Some(consumer) => json_reply(&consumer.info()),
        None => Some(err_reply(JetStreamError::ConsumerNotFound)),
    }
}

fn consumer_delete_request(
    ledger: &Arc<Ledger>,
    account: &str,
    d: Delivery<'_>,
) -> Option<Vec<u8>> {
    let Some(jsa) = ledger.lookup_account(account) else {
        return Some(NOT_ENABLED.into());
    };
    if !d.payload.is_empty() {
        return Some(BAD_REQUEST.into());
    }
    let stream_name = token_at(d.subject, NAME_TOKEN)?;
    let stream = match jsa.lookup_stream(stream_name) {
        Ok(stream) => stream,
        Err(err) => return Some(err_reply(err)),
    };
    let consumer_name = token_at(d.subject, CONSUMER_TOKEN)?;
    let Some(consumer) = stream.lookup_consumer(consumer_name) else {
        return Some(err_reply(JetStreamError::ConsumerNotFound));
    };
    Some(match consumer.delete() {
        Ok(()) => OK.into(),
        Err(err) => err_reply(err),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_reply_shape() {
        assert_eq!(
            err_reply(JetStreamError::StreamNotFound),
            b"-ERR 'stream not found'"
        );
        assert_eq!(
            err_reply(format_args!("sequence [{}] not found", 99999)),
            b"-ERR 'sequence [99999] not found'"
        );
        assert_eq!(BAD_REQUEST, "-ERR 'bad request'");
        assert_eq!(NOT_ENABLED, "-ERR 'jetstream not enabled for account'");
    }

    #[test]
    fn endpoint_table_is_complete() {
        assert_eq!(ALL_ENDPOINTS.len(), 17);
        assert!(ALL_ENDPOINTS.contains(&API_EPHEMERAL_CONSUMER_CREATE));
    }
}
