//! AMQP connection lifecycle and queue topology.
//!
//! The topology is one durable direct exchange, the durable sync queue and
//! a durable dead-letter queue bound to the same exchange. Declarations
//! use identical arguments every time, so redeclaring on each start is a
//! no-op for the broker.

use lapin::options::{
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use circle_types::BrokerSettings;

use crate::error::SyncError;

/// Static names of the sync exchange, queues and bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerTopology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub dead_letter_queue: String,
    pub dead_letter_routing_key: String,
}

impl BrokerTopology {
    pub fn from_settings(settings: &BrokerSettings) -> Self {
        Self {
            exchange: settings.exchange.clone(),
            queue: settings.queue.clone(),
            routing_key: settings.routing_key.clone(),
            dead_letter_queue: settings.dead_letter_queue(),
            dead_letter_routing_key: settings.dead_letter_routing_key(),
        }
    }

    /// Declare exchange, queues and bindings on a channel.
    pub async fn declare(&self, channel: &Channel) -> Result<(), SyncError> {
        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        for (queue, routing_key) in [
            (&self.queue, &self.routing_key),
            (&self.dead_letter_queue, &self.dead_letter_routing_key),
        ] {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;

            channel
                .queue_bind(
                    queue,
                    &self.exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;

            debug!(queue = %queue, routing_key = %routing_key, "Declared and bound queue");
        }

        Ok(())
    }
}

/// Connection target built field by field, so credentials never pass
/// through URI parsing and need no escaping.
pub fn amqp_uri(settings: &BrokerSettings) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: settings.username.clone(),
                password: settings.password.expose_secret().to_string(),
            },
            host: settings.host.clone(),
            port: settings.port,
        },
        vhost: settings.vhost_name().to_string(),
        ..AMQPUri::default()
    }
}

/// An open connection with one shared channel and a declared topology.
///
/// Owned by the application root and closed exactly once.
pub struct BrokerConnection {
    connection: Connection,
    channel: Channel,
    topology: BrokerTopology,
}

impl BrokerConnection {
    /// Connect, open a channel in publisher-confirm mode and declare the
    /// topology.
    pub async fn open(settings: &BrokerSettings) -> Result<Self, SyncError> {
        let connection =
            Connection::connect_uri(amqp_uri(settings), ConnectionProperties::default()).await?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(0, "channel open failed").await;
                return Err(e.into());
            }
        };
        if let Err(e) = channel.confirm_select(ConfirmSelectOptions::default()).await {
            let _ = connection.close(0, "confirm select failed").await;
            return Err(e.into());
        }

        let topology = BrokerTopology::from_settings(settings);
        if let Err(e) = topology.declare(&channel).await {
            let _ = connection.close(0, "topology declare failed").await;
            return Err(e);
        }

        info!(
            broker = %settings.display_target(),
            exchange = %topology.exchange,
            queue = %topology.queue,
            "Connected to broker"
        );

        Ok(Self {
            connection,
            channel,
            topology,
        })
    }

    /// Clone of the shared channel. lapin channels are safe to use from
    /// several tasks at once.
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn topology(&self) -> &BrokerTopology {
        &self.topology
    }

    /// Close the channel, then the connection.
    pub async fn close(self) -> Result<(), SyncError> {
        if let Err(e) = self.channel.close(200, "shutdown").await {
            warn!(error = %e, "Failed to close broker channel");
        }
        self.connection.close(200, "shutdown").await?;
        info!("Broker connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    #[test]
    fn test_topology_from_settings() {
        let topology = BrokerTopology::from_settings(&BrokerSettings::default());
        assert_eq!(
            topology,
            BrokerTopology {
                exchange: "circle_sync_exchange".to_string(),
                queue: "circle_sync_queue".to_string(),
                routing_key: "circle.sync".to_string(),
                dead_letter_queue: "circle_sync_queue.dead".to_string(),
                dead_letter_routing_key: "circle.sync.dead".to_string(),
            }
        );
    }

    #[test]
    fn test_uri_keeps_reserved_characters_in_credentials() {
        let settings = BrokerSettings {
            username: "circle:sync".to_string(),
            password: SecretString::from("p@ss/w:rd".to_string()),
            host: "mq.internal".to_string(),
            vhost: "/forum".to_string(),
            ..BrokerSettings::default()
        };
        let uri = amqp_uri(&settings);

        assert_eq!(uri.authority.userinfo.username, "circle:sync");
        assert_eq!(uri.authority.userinfo.password, "p@ss/w:rd");
        assert_eq!(uri.authority.host, "mq.internal");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.vhost, "forum");
    }

    #[test]
    fn test_uri_default_vhost() {
        let uri = amqp_uri(&BrokerSettings::default());
        assert_eq!(uri.vhost, "/");
        assert_eq!(uri.authority.userinfo.username, "guest");
    }

    #[test]
    fn test_topology_follows_custom_names() {
        let settings = BrokerSettings {
            exchange: "forum".to_string(),
            queue: "forum_circles".to_string(),
            routing_key: "circles".to_string(),
            ..BrokerSettings::default()
        };
        let topology = BrokerTopology::from_settings(&settings);
        assert_eq!(topology.dead_letter_queue, "forum_circles.dead");
        assert_eq!(topology.dead_letter_routing_key, "circles.dead");
    }
}
