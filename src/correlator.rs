use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    model::SharedModel,
    radio::SendCondition,
    sender::{MessageSender, Priority, RetryBudget},
};

/// Answers the brake's data requests, one at a time
///
/// The brake polls far more often than a send completes. A request that
/// arrives while the previous answer is still queued or on air is dropped.
pub struct RequestCorrelator {
    sender: Arc<MessageSender>,
    in_flight: Arc<Mutex<bool>>,
    timeout: Duration,
}

impl RequestCorrelator {
    /// Create a correlator answering through `sender`, each answer bounded by `timeout`
    #[must_use]
    pub fn new(sender: Arc<MessageSender>, timeout: Duration) -> Self {
        Self {
            sender,
            in_flight: Arc::new(Mutex::new(false)),
            timeout,
        }
    }

    /// Whether an answer is still pending
    pub async fn is_in_flight(&self) -> bool {
        *self.in_flight.lock().await
    }

    /// Handle a data request, returns whether an answer was queued
    pub async fn on_data_requested(&self, model: &SharedModel) -> bool {
        {
            let mut in_flight = self.in_flight.lock().await;
            if *in_flight {
                debug!("Data request ignored, previous answer in flight");
                return false;
            }
            *in_flight = true;
        }

        let packet = model.read().await.data_packet();
        let done = self.sender.submit(
            packet,
            SendCondition::ChannelTx,
            RetryBudget::single(self.timeout),
            Priority::Poll,
        );

        let in_flight = Arc::clone(&self.in_flight);
        tokio::spawn(async move {
            if let Ok(Err(error)) = done.await {
                debug!("Data answer not sent: {}", error);
            }
            *in_flight.lock().await = false;
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::BrakeModel, radio::mock::MockRadio, types::Mode};
    use tokio::time;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_send_once() {
        let radio = MockRadio::new();
        radio.set_send_delay(Duration::from_millis(300));
        let sender = Arc::new(MessageSender::spawn(radio.channel()));
        let correlator = RequestCorrelator::new(sender, Duration::from_secs(1));
        let model = BrakeModel::shared(Mode::TargetPower);

        let (first, second) = tokio::join!(
            correlator.on_data_requested(&model),
            correlator.on_data_requested(&model)
        );
        assert!(first ^ second);

        time::sleep(Duration::from_millis(100)).await;
        assert!(correlator.is_in_flight().await);
        assert!(!correlator.on_data_requested(&model).await);

        time::sleep(Duration::from_millis(400)).await;
        assert!(!correlator.is_in_flight().await);
        assert_eq!(radio.sent().len(), 1);
        assert_eq!(radio.sent()[0], model.read().await.data_packet());
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_request_after_completion() {
        let radio = MockRadio::new();
        let sender = Arc::new(MessageSender::spawn(radio.channel()));
        let correlator = RequestCorrelator::new(sender, Duration::from_secs(1));
        let model = BrakeModel::shared(Mode::TargetSlope);

        assert!(correlator.on_data_requested(&model).await);
        time::sleep(Duration::from_millis(10)).await;

        model.write().await.set_resistance(120.0);
        assert!(correlator.on_data_requested(&model).await);
        time::sleep(Duration::from_millis(10)).await;

        let sent = radio.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].as_bytes()[3..5], [0x00, 120]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_poll_clears_flag() {
        let radio = MockRadio::new();
        let sender = Arc::new(MessageSender::spawn(radio.channel()));
        let correlator = RequestCorrelator::new(Arc::clone(&sender), Duration::from_secs(1));
        let model = BrakeModel::shared(Mode::TargetSpeed);

        let _guard = sender.pause();
        assert!(correlator.on_data_requested(&model).await);
        time::sleep(Duration::from_millis(10)).await;

        assert!(!correlator.is_in_flight().await);
        assert!(radio.sent().is_empty());
    }
}
