use crate::broker::{InboundMessage, MessageSource, RecordSink, TransportError};
use crate::config::{BrokerAddr, Config};
use crate::stats::ProcessorStats;
use async_trait::async_trait;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Publish, QoS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

const REQUEST_CAPACITY: usize = 64;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Consuming half of the MQTT transport. Manual acks stand in for offset
/// commits. A message that fails handling is kept unacked in `redelivery`
/// and returned by the next `recv`, so the loop retries it until it commits,
/// like a partition stalled on an uncommitted offset. The broker stops
/// sending once its in-flight window of unacked messages is full, which
/// also bounds the inbound buffer; only one failed message is held at a time.
pub struct MqttSource {
    client: AsyncClient,
    inbound: mpsc::UnboundedReceiver<Publish>,
    redelivery: Option<Publish>,
}

/// Producing half. Keyed records go to `<topic>/<key>` at QoS 1; `flush`
/// waits for the broker's PUBACK on everything submitted.
#[derive(Clone)]
pub struct MqttSink {
    client: AsyncClient,
    submitted: Arc<AtomicU64>,
    acked: watch::Receiver<u64>,
    flush_timeout: Duration,
}

pub fn input_filter(config: &Config) -> String {
    if config.group_id.trim().is_empty() {
        config.topic_in.clone()
    } else {
        format!("$share/{}/{}", config.group_id, config.topic_in)
    }
}

/// Keys become a topic level, so MQTT wildcard and separator characters are
/// replaced.
pub fn keyed_topic(topic: &str, key: &str) -> String {
    let key: String = key
        .chars()
        .map(|c| match c {
            '/' | '+' | '#' => '_',
            other => other,
        })
        .collect();
    format!("{topic}/{key}")
}

fn mqtt_options(config: &Config, broker: &BrokerAddr) -> MqttOptions {
    let mut options = MqttOptions::new(config.client_id.clone(), broker.host.clone(), broker.port);
    options.set_keep_alive(config.keepalive());
    options.set_clean_session(false);
    options.set_manual_acks(true);
    if let Some(username) = &config.broker_username {
        options.set_credentials(
            username.clone(),
            config.broker_password.clone().unwrap_or_default(),
        );
    }
    options
}

pub fn connect(
    config: &Config,
    stats: Arc<ProcessorStats>,
) -> (MqttSource, MqttSink, JoinHandle<()>) {
    let options = mqtt_options(config, &config.brokers[0]);
    let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (acked_tx, acked_rx) = watch::channel(0u64);

    let poller = spawn_poller(
        config.clone(),
        client.clone(),
        eventloop,
        inbound_tx,
        acked_tx,
        stats,
    );

    let source = MqttSource {
        client: client.clone(),
        inbound: inbound_rx,
        redelivery: None,
    };
    let sink = MqttSink {
        client,
        submitted: Arc::new(AtomicU64::new(0)),
        acked: acked_rx,
        flush_timeout: config.flush_timeout(),
    };
    (source, sink, poller)
}

enum Dispatch {
    Connected { session_present: bool },
    Continue,
    ConsumerGone,
}

/// Routes one event-loop event without awaiting, so PUBACKs keep flowing to
/// a pending `flush` even while the consumer is busy.
fn dispatch(
    event: Event,
    inbound: &mpsc::UnboundedSender<Publish>,
    acked: &watch::Sender<u64>,
) -> Dispatch {
    match event {
        Event::Incoming(Incoming::ConnAck(connack)) => Dispatch::Connected {
            session_present: connack.session_present,
        },
        Event::Incoming(Incoming::Publish(publish)) => {
            tracing::trace!(topic = %publish.topic, pkid = publish.pkid, "received message");
            match inbound.send(publish) {
                Ok(()) => Dispatch::Continue,
                Err(_) => Dispatch::ConsumerGone,
            }
        }
        Event::Incoming(Incoming::PubAck(_)) => {
            acked.send_modify(|count| *count += 1);
            Dispatch::Continue
        }
        _ => Dispatch::Continue,
    }
}

fn spawn_poller(
    config: Config,
    client: AsyncClient,
    mut eventloop: EventLoop,
    inbound: mpsc::UnboundedSender<Publish>,
    acked: watch::Sender<u64>,
    stats: Arc<ProcessorStats>,
) -> JoinHandle<()> {
    let filter = input_filter(&config);
    tokio::spawn(async move {
        let mut broker_index = 0usize;
        loop {
            match eventloop.poll().await {
                Ok(event) => match dispatch(event, &inbound, &acked) {
                    Dispatch::Connected { session_present } => {
                        stats.set_broker_connected(true);
                        let broker = &config.brokers[broker_index];
                        tracing::info!(broker = %broker, session_present, "connected to broker");
                        if !session_present {
                            // Queued without awaiting: the request channel drains only through this poll.
                            match client.try_subscribe(filter.clone(), QoS::AtLeastOnce) {
                                Ok(()) => tracing::info!(topic = %filter, "subscribed to input stream"),
                                Err(err) => tracing::warn!(error = %err, topic = %filter, "failed to queue subscription"),
                            }
                        }
                    }
                    Dispatch::Continue => {}
                    Dispatch::ConsumerGone => {
                        tracing::info!("consumer dropped; stopping broker event loop");
                        return;
                    }
                },
                Err(err) => {
                    stats.set_broker_connected(false);
                    stats.record_error(err.to_string());
                    let previous = config.brokers[broker_index].to_string();
                    broker_index = (broker_index + 1) % config.brokers.len();
                    let next = &config.brokers[broker_index];
                    tracing::warn!(error = %err, broker = %previous, next = %next, "broker connection dropped; reconnecting");
                    eventloop.mqtt_options = mqtt_options(&config, next);
                    sleep(RECONNECT_BACKOFF).await;
                }
            }
        }
    })
}

#[async_trait]
impl MessageSource for MqttSource {
    type Ack = Publish;

    async fn recv(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<InboundMessage<Publish>>, TransportError> {
        if let Some(publish) = self.redelivery.take() {
            return Ok(Some(inbound_message(publish)));
        }
        match tokio::time::timeout(timeout, self.inbound.recv()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(TransportError::Closed),
            Ok(Some(publish)) => Ok(Some(inbound_message(publish))),
        }
    }

    async fn commit(&mut self, message: &InboundMessage<Publish>) -> Result<(), TransportError> {
        self.client
            .ack(&message.ack)
            .await
            .map_err(|err| TransportError::Commit(err.to_string()))
    }

    fn redeliver(&mut self, message: InboundMessage<Publish>) {
        self.redelivery = Some(message.ack);
    }
}

fn inbound_message(publish: Publish) -> InboundMessage<Publish> {
    InboundMessage {
        topic: publish.topic.clone(),
        payload: publish.payload.clone(),
        received_at: Utc::now(),
        ack: publish,
    }
}

#[async_trait]
impl RecordSink for MqttSink {
    async fn send(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let full_topic = keyed_topic(topic, key);
        self.client
            .publish(full_topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|err| TransportError::Send {
                topic: topic.to_string(),
                reason: err.to_string(),
            })?;
        self.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn flush(&self) -> Result<(), TransportError> {
        let target = self.submitted.load(Ordering::SeqCst);
        let mut acked = self.acked.clone();
        let waited = tokio::time::timeout(self.flush_timeout, async {
            acked.wait_for(|count| *count >= target).await.map(|_| ())
        })
        .await;
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Flush("broker event loop stopped".into())),
            Err(_) => Err(TransportError::FlushTimeout(self.flush_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::PubAck;

    #[test]
    fn keys_are_sanitized_into_one_topic_level() {
        assert_eq!(keyed_topic("processed-metrics", "s1"), "processed-metrics/s1");
        assert_eq!(keyed_topic("anomaly-detected", "a/b+#"), "anomaly-detected/a_b__");
    }

    #[tokio::test]
    async fn flush_waits_for_pubacks() {
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 8);
        let (acked_tx, acked_rx) = watch::channel(0u64);
        let sink = MqttSink {
            client,
            submitted: Arc::new(AtomicU64::new(2)),
            acked: acked_rx,
            flush_timeout: Duration::from_millis(50),
        };

        assert!(matches!(
            sink.flush().await,
            Err(TransportError::FlushTimeout(_))
        ));

        acked_tx.send_modify(|n| *n += 2);
        sink.flush().await.unwrap();
    }

    #[tokio::test]
    async fn pubacks_reach_flush_while_inbound_backlog_is_unread() {
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 8);
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let (acked_tx, acked_rx) = watch::channel(0u64);
        let sink = MqttSink {
            client,
            submitted: Arc::new(AtomicU64::new(1)),
            acked: acked_rx,
            flush_timeout: Duration::from_secs(5),
        };

        for _ in 0..500 {
            let publish = Publish::new("sensor-readings", QoS::AtLeastOnce, b"{}".to_vec());
            assert!(matches!(
                dispatch(Event::Incoming(Incoming::Publish(publish)), &inbound_tx, &acked_tx),
                Dispatch::Continue
            ));
        }
        dispatch(Event::Incoming(Incoming::PubAck(PubAck::new(1))), &inbound_tx, &acked_tx);

        sink.flush().await.unwrap();
    }

    #[tokio::test]
    async fn failed_message_is_received_again_first() {
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 8);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let mut source = MqttSource {
            client,
            inbound: inbound_rx,
            redelivery: None,
        };
        inbound_tx
            .send(Publish::new("sensor-readings", QoS::AtLeastOnce, b"a".to_vec()))
            .unwrap();
        inbound_tx
            .send(Publish::new("sensor-readings", QoS::AtLeastOnce, b"b".to_vec()))
            .unwrap();

        let first = source.recv(Duration::from_millis(10)).await.unwrap().unwrap();
        source.redeliver(first);
        let again = source.recv(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(&again.payload[..], b"a");
        let next = source.recv(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(&next.payload[..], b"b");
        assert!(source.recv(Duration::from_millis(10)).await.unwrap().is_none());
    }
}
