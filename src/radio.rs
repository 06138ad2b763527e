use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

use crate::{error::Result, protocol::Packet, types::ChannelConfig};

/// 8-byte network key a channel is assigned to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkKey(pub [u8; 8]);

impl NetworkKey {
    /// The public network
    pub const PUBLIC: Self = Self([0x00; 8]);
}

/// Channel identity used to find the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelId {
    /// Device number (0 = wildcard)
    pub device_number: u16,
    /// Device type
    pub device_type: u8,
    /// Transmission type (0 = wildcard)
    pub transmission_type: u8,
    /// Pairing request flag
    pub pairing: bool,
}

impl From<&ChannelConfig> for ChannelId {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            device_number: config.device_number,
            device_type: config.device_type,
            transmission_type: config.transmission_type,
            pairing: config.pairing,
        }
    }
}

/// Message classes a listener can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Broadcast data messages
    BroadcastData,
}

/// Event that completes a `send_and_wait`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendCondition {
    /// The packet left in the channel's next transmit slot
    ChannelTx,
}

/// Handle for a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

/// An ANT node owning a handful of channels
#[async_trait]
pub trait RadioNode: Send + Sync {
    /// Stop the node, releasing every channel
    async fn stop(&self) -> Result<()>;

    /// Start the node
    async fn start(&self) -> Result<()>;

    /// Claim an unused channel, `None` if all are taken
    async fn free_channel(&self) -> Option<Arc<dyn RadioChannel>>;

    /// Hand a channel back to the node
    async fn release_channel(&self, channel: Arc<dyn RadioChannel>);
}

/// One radio channel talking to the brake
#[async_trait]
pub trait RadioChannel: Send + Sync {
    /// Assign the channel to a network as a slave of the brake
    async fn assign(&self, key: NetworkKey) -> Result<()>;

    /// Set the identity of the device to track
    async fn set_id(&self, id: ChannelId) -> Result<()>;

    /// Set the RF frequency offset
    async fn set_frequency(&self, frequency: u8) -> Result<()>;

    /// Set the message period
    async fn set_period(&self, period: u16) -> Result<()>;

    /// Set how long the channel searches for the brake, `None` searches until closed
    async fn set_search_timeout(&self, timeout: Option<Duration>) -> Result<()>;

    /// Open the channel
    async fn open(&self) -> Result<()>;

    /// Close the channel
    async fn close(&self) -> Result<()>;

    /// Unassign the channel
    async fn unassign(&self) -> Result<()>;

    /// Deliver every received message of `kind` into `sender`
    fn register_rx_listener(
        &self,
        kind: MessageKind,
        sender: mpsc::UnboundedSender<Packet>,
    ) -> ListenerId;

    /// Stop delivering to a listener
    fn remove_rx_listener(&self, id: ListenerId);

    /// Send `packet` and wait until `condition` is met
    ///
    /// # Errors
    ///
    /// Returns [`crate::BrakeError::Timeout`] if the condition is not met in
    /// time, or a transport error.
    async fn send_and_wait(
        &self,
        packet: Packet,
        condition: SendCondition,
        timeout: Duration,
    ) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory radio used by the unit tests.

    use super::*;
    use crate::error::BrakeError;
    use std::{
        collections::{HashMap, VecDeque},
        sync::Mutex,
    };

    /// Everything the session did to the radio, in order
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum RadioCall {
        NodeStop,
        NodeStart,
        FreeChannel,
        ReleaseChannel,
        Assign,
        SetId(ChannelId),
        SetFrequency(u8),
        SetPeriod(u16),
        SetSearchTimeout(Option<Duration>),
        Open,
        Close,
        Unassign,
        Send(Packet, SendCondition),
    }

    #[derive(Default)]
    struct Shared {
        calls: Vec<RadioCall>,
        listeners: HashMap<ListenerId, (MessageKind, mpsc::UnboundedSender<Packet>)>,
        next_listener: u64,
        send_delay: Duration,
        send_failures: VecDeque<BrakeError>,
        hang_on_open: bool,
    }

    #[derive(Clone, Default)]
    pub struct MockRadio {
        shared: Arc<Mutex<Shared>>,
        no_channels: Arc<Mutex<bool>>,
    }

    impl MockRadio {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn without_channels() -> Self {
            let radio = Self::default();
            *radio.no_channels.lock().unwrap() = true;
            radio
        }

        pub fn calls(&self) -> Vec<RadioCall> {
            self.shared.lock().unwrap().calls.clone()
        }

        pub fn sent(&self) -> Vec<Packet> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    RadioCall::Send(packet, _) => Some(packet),
                    _ => None,
                })
                .collect()
        }

        pub fn listener_count(&self) -> usize {
            self.shared.lock().unwrap().listeners.len()
        }

        pub fn set_send_delay(&self, delay: Duration) {
            self.shared.lock().unwrap().send_delay = delay;
        }

        pub fn fail_next_sends(&self, errors: impl IntoIterator<Item = BrakeError>) {
            self.shared.lock().unwrap().send_failures.extend(errors);
        }

        pub fn hang_on_open(&self) {
            self.shared.lock().unwrap().hang_on_open = true;
        }

        /// Push a broadcast to every listener, as the transport would
        pub fn broadcast(&self, packet: Packet) {
            let shared = self.shared.lock().unwrap();
            for (kind, sender) in shared.listeners.values() {
                if *kind == MessageKind::BroadcastData {
                    let _ = sender.send(packet);
                }
            }
        }

        fn record(&self, call: RadioCall) {
            self.shared.lock().unwrap().calls.push(call);
        }

        pub fn channel(&self) -> Arc<dyn RadioChannel> {
            Arc::new(self.clone())
        }
    }

    #[async_trait]
    impl RadioNode for MockRadio {
        async fn stop(&self) -> Result<()> {
            self.record(RadioCall::NodeStop);
            Ok(())
        }

        async fn start(&self) -> Result<()> {
            self.record(RadioCall::NodeStart);
            Ok(())
        }

        async fn free_channel(&self) -> Option<Arc<dyn RadioChannel>> {
            self.record(RadioCall::FreeChannel);
            if *self.no_channels.lock().unwrap() {
                None
            } else {
                Some(self.channel())
            }
        }

        async fn release_channel(&self, _channel: Arc<dyn RadioChannel>) {
            self.record(RadioCall::ReleaseChannel);
        }
    }

    #[async_trait]
    impl RadioChannel for MockRadio {
        async fn assign(&self, _key: NetworkKey) -> Result<()> {
            self.record(RadioCall::Assign);
            Ok(())
        }

        async fn set_id(&self, id: ChannelId) -> Result<()> {
            self.record(RadioCall::SetId(id));
            Ok(())
        }

        async fn set_frequency(&self, frequency: u8) -> Result<()> {
            self.record(RadioCall::SetFrequency(frequency));
            Ok(())
        }

        async fn set_period(&self, period: u16) -> Result<()> {
            self.record(RadioCall::SetPeriod(period));
            Ok(())
        }

        async fn set_search_timeout(&self, timeout: Option<Duration>) -> Result<()> {
            self.record(RadioCall::SetSearchTimeout(timeout));
            Ok(())
        }

        async fn open(&self) -> Result<()> {
            self.record(RadioCall::Open);
            let hang = self.shared.lock().unwrap().hang_on_open;
            if hang {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.record(RadioCall::Close);
            Ok(())
        }

        async fn unassign(&self) -> Result<()> {
            self.record(RadioCall::Unassign);
            Ok(())
        }

        fn register_rx_listener(
            &self,
            kind: MessageKind,
            sender: mpsc::UnboundedSender<Packet>,
        ) -> ListenerId {
            let mut shared = self.shared.lock().unwrap();
            shared.next_listener += 1;
            let id = ListenerId(shared.next_listener);
            shared.listeners.insert(id, (kind, sender));
            id
        }

        fn remove_rx_listener(&self, id: ListenerId) {
            self.shared.lock().unwrap().listeners.remove(&id);
        }

        async fn send_and_wait(
            &self,
            packet: Packet,
            condition: SendCondition,
            timeout: Duration,
        ) -> Result<()> {
            self.record(RadioCall::Send(packet, condition));
            let (delay, failure) = {
                let mut shared = self.shared.lock().unwrap();
                (shared.send_delay, shared.send_failures.pop_front())
            };
            if let Some(error) = failure {
                return Err(error);
            }
            if delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(BrakeError::Timeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}
