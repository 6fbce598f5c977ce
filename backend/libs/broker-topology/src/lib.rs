//! AMQP 0-9-1 topology for the order-dispatch broker: one main queue per
//! logical consumer plus a `.wait`/`.parking` pair wired through a
//! dead-letter exchange so a negative ack becomes a timed redelivery instead
//! of an immediate tight-loop retry.
//!
//! ```text
//! orders_exchange --Q--> Q ----nack(no requeue)----> dlx_exchange --Q--> Q.wait
//!        ^                                                                 |
//!        |                                                 x-message-ttl=10s
//!        +---------------------------------------------------------------+
//! ```
//!
//! `Q.parking` hangs off neither exchange: messages land there only via a
//! direct publish from the consumer once retries are exhausted.

mod error;

pub use error::{BrokerError, BrokerResult};

use deadpool_lapin::{Config, Manager, Pool, Runtime};
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Consumer as LapinConsumer, ExchangeKind};
use tracing::info;

/// Name of the direct exchange publishers and the main queues bind to.
pub const ORDERS_EXCHANGE: &str = "orders_exchange";
/// Name of the dead-letter exchange a negative ack is routed through.
pub const DLX_EXCHANGE: &str = "dlx_exchange";
/// How long a message ages in `<queue>.wait` before being redelivered.
pub const WAIT_QUEUE_TTL_MS: i32 = 10_000;

/// The three queues backing one logical consumer.
#[derive(Debug, Clone)]
pub struct QueueTopology {
    pub queue: String,
    pub wait_queue: String,
    pub parking_queue: String,
}

impl QueueTopology {
    pub fn new(queue: impl Into<String>) -> Self {
        let queue = queue.into();
        let wait_queue = format!("{queue}.wait");
        let parking_queue = format!("{queue}.parking");
        Self {
            queue,
            wait_queue,
            parking_queue,
        }
    }
}

/// Open a pooled connection to the broker. Cloning the returned `Pool` is
/// cheap; share one per process.
pub fn connect_pool(amqp_url: &str) -> BrokerResult<Pool> {
    let mut cfg = Config::default();
    cfg.url = Some(amqp_url.to_string());
    let pool = cfg.create_pool(Some(Runtime::Tokio1))?;
    Ok(pool)
}

/// Declare `orders_exchange`, `dlx_exchange`, and the given queue's `Q`/
/// `Q.wait`/`Q.parking` triple, wiring the DLX + TTL arguments described in
/// the module docs. Declarations are idempotent -- safe to call from every
/// process that starts up against this broker.
pub async fn declare_topology(channel: &Channel, topology: &QueueTopology) -> BrokerResult<()> {
    channel
        .exchange_declare(
            ORDERS_EXCHANGE,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    channel
        .exchange_declare(
            DLX_EXCHANGE,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    let mut main_args = FieldTable::default();
    main_args.insert(
        ShortString::from("x-dead-letter-exchange"),
        AMQPValue::LongString(LongString::from(DLX_EXCHANGE)),
    );
    main_args.insert(
        ShortString::from("x-dead-letter-routing-key"),
        AMQPValue::LongString(LongString::from(topology.queue.clone())),
    );
    channel
        .queue_declare(
            &topology.queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            main_args,
        )
        .await?;

    let mut wait_args = FieldTable::default();
    wait_args.insert(
        ShortString::from("x-dead-letter-exchange"),
        AMQPValue::LongString(LongString::from(ORDERS_EXCHANGE)),
    );
    wait_args.insert(
        ShortString::from("x-dead-letter-routing-key"),
        AMQPValue::LongString(LongString::from(topology.queue.clone())),
    );
    wait_args.insert(
        ShortString::from("x-message-ttl"),
        AMQPValue::LongInt(WAIT_QUEUE_TTL_MS),
    );
    channel
        .queue_declare(
            &topology.wait_queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            wait_args,
        )
        .await?;

    channel
        .queue_declare(
            &topology.parking_queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_bind(
            &topology.queue,
            ORDERS_EXCHANGE,
            &topology.queue,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_bind(
            &topology.wait_queue,
            DLX_EXCHANGE,
            &topology.queue,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    info!(
        queue = %topology.queue,
        wait_queue = %topology.wait_queue,
        parking_queue = %topology.parking_queue,
        "broker topology declared"
    );
    Ok(())
}

/// Subscribe to `topology.queue` with manual acks and `prefetch = 2 * workers`.
pub async fn consume(
    channel: &Channel,
    topology: &QueueTopology,
    consumer_tag: &str,
    prefetch: u16,
) -> BrokerResult<LapinConsumer> {
    channel
        .basic_qos(prefetch, BasicQosOptions::default())
        .await?;

    let consumer = channel
        .basic_consume(
            &topology.queue,
            consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    Ok(consumer)
}

/// Direct-publish an exhausted message to its parking queue via the default
/// exchange, tagging it with the queue it fell out of and why.
pub async fn publish_to_parking(
    channel: &Channel,
    topology: &QueueTopology,
    payload: &[u8],
    fail_reason: &str,
) -> BrokerResult<()> {
    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from("x-original-queue"),
        AMQPValue::LongString(LongString::from(topology.queue.clone())),
    );
    headers.insert(
        ShortString::from("x-fail-reason"),
        AMQPValue::LongString(LongString::from(fail_reason)),
    );

    let properties = BasicProperties::default()
        .with_delivery_mode(2)
        .with_headers(headers);

    channel
        .basic_publish(
            "",
            &topology.parking_queue,
            BasicPublishOptions::default(),
            payload,
            properties,
        )
        .await?
        .await?;

    Ok(())
}

/// Derive the broker-observed retry count from a delivery's `x-death` header
/// array -- the count the consumer pipeline's retry/parking decision uses,
/// as distinct from the outbox's own advisory `attempt_count` column.
///
/// One `Q -> dlx -> Q.wait -> Q` round trip appends *two* distinct entries
/// to `x-death` (one recorded at `queue` with reason `rejected`, one
/// recorded at `<queue>.wait` with reason `expired`), each with its own
/// `count`. Only the entry whose `queue` field matches the main queue
/// reflects the number of times this message was actually rejected from
/// it; summing across both entries would double the real retry count.
pub fn death_count(headers: Option<&FieldTable>, queue: &str) -> u32 {
    let Some(headers) = headers else {
        return 0;
    };
    let Some(AMQPValue::FieldArray(deaths)) = headers.inner().get("x-death") else {
        return 0;
    };
    deaths
        .as_slice()
        .iter()
        .filter_map(|death| match death {
            AMQPValue::FieldTable(table) => {
                let entry_queue = match table.inner().get("queue") {
                    Some(AMQPValue::LongString(s)) => Some(s.to_string()),
                    Some(AMQPValue::ShortString(s)) => Some(s.to_string()),
                    _ => None,
                };
                if entry_queue.as_deref() != Some(queue) {
                    return None;
                }
                table.inner().get("count").and_then(|v| match v {
                    AMQPValue::LongLongInt(n) => Some(*n as u32),
                    AMQPValue::LongInt(n) => Some(*n as u32),
                    _ => None,
                })
            }
            _ => None,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_topology_derives_wait_and_parking_names() {
        let topology = QueueTopology::new("orders.created");
        assert_eq!(topology.queue, "orders.created");
        assert_eq!(topology.wait_queue, "orders.created.wait");
        assert_eq!(topology.parking_queue, "orders.created.parking");
    }

    #[test]
    fn death_count_is_zero_without_headers() {
        assert_eq!(death_count(None, "orders.created"), 0);
    }

    #[test]
    fn death_count_is_zero_without_x_death() {
        let headers = FieldTable::default();
        assert_eq!(death_count(Some(&headers), "orders.created"), 0);
    }

    fn death_entry(queue: &str, reason: &str, count: i64) -> AMQPValue {
        let mut table = FieldTable::default();
        table.insert(ShortString::from("queue"), AMQPValue::LongString(LongString::from(queue)));
        table.insert(ShortString::from("reason"), AMQPValue::LongString(LongString::from(reason)));
        table.insert(ShortString::from("count"), AMQPValue::LongLongInt(count));
        AMQPValue::FieldTable(table)
    }

    /// One `Q -> dlx -> Q.wait -> Q` round trip after two traversals: the
    /// broker has merged these into one entry per (queue, reason) pair, each
    /// with `count=2`. Only the `orders.created` (main queue) entry should
    /// be counted -- matching spec scenario 3's "attempt_count observed via
    /// x-death reaches 2", not 4.
    #[test]
    fn death_count_filters_to_main_queue_entry() {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from("x-death"),
            AMQPValue::FieldArray(lapin::types::FieldArray::from(vec![
                death_entry("orders.created", "rejected", 2),
                death_entry("orders.created.wait", "expired", 2),
            ])),
        );
        assert_eq!(death_count(Some(&headers), "orders.created"), 2);
    }

    #[test]
    fn death_count_ignores_entries_for_other_queues() {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from("x-death"),
            AMQPValue::FieldArray(lapin::types::FieldArray::from(vec![death_entry(
                "some.other.queue",
                "rejected",
                5,
            )])),
        );
        assert_eq!(death_count(Some(&headers), "orders.created"), 0);
    }
}
