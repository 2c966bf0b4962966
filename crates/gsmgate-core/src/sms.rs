//! Relay of stored SMS to the remote peer.

use std::collections::HashSet;
use std::sync::Arc;

use crate::call::forwarder::SmsForwarder;
use crate::error::ModemError;
use crate::modem::at;
use crate::modem::channel::CommandChannel;

pub struct SmsRelay<S> {
    forwarder: Arc<S>,
    /// Storage slots already relayed whose delete failed. Only the delete is
    /// retried for them.
    undeleted: HashSet<u32>,
}

impl<S: SmsForwarder> SmsRelay<S> {
    pub fn new(forwarder: Arc<S>) -> Self {
        SmsRelay {
            forwarder,
            undeleted: HashSet::new(),
        }
    }

    /// List every stored message, relay each one not relayed before and
    /// delete it from storage once relayed. A message that fails to relay
    /// stays stored and is listed again on the next `+CMTI`. Returns the
    /// number of messages relayed.
    pub async fn relay_stored(&mut self, commands: &CommandChannel) -> Result<usize, ModemError> {
        let listing = commands.run_ok(at::LIST_SMS).await?;
        let messages = at::parse_sms_list(&listing);

        if messages.is_empty() {
            self.undeleted.clear();
            let raw = listing.body().join("\n");
            if raw.trim().is_empty() {
                tracing::debug!("no stored SMS");
                return Ok(0);
            }
            tracing::warn!(listing = %raw, "unparseable SMS listing, relaying raw");
            return match self.forwarder.send(raw).await {
                Ok(()) => Ok(1),
                Err(e) => {
                    tracing::warn!(error = %e, "SMS relay failed");
                    Ok(0)
                }
            };
        }

        // Slots that vanished from storage are free for new messages.
        self.undeleted
            .retain(|index| messages.iter().any(|m| m.index == *index));

        let mut relayed = 0;
        for sms in messages {
            if self.undeleted.contains(&sms.index) {
                tracing::debug!(index = sms.index, "retrying delete of relayed SMS");
                self.delete(commands, sms.index).await;
                continue;
            }
            match self.forwarder.send(sms.relay_text()).await {
                Ok(()) => {
                    relayed += 1;
                    tracing::info!(index = sms.index, sender = %sms.sender, "SMS relayed");
                    self.delete(commands, sms.index).await;
                }
                Err(e) => {
                    tracing::warn!(index = sms.index, error = %e, "SMS relay failed, keeping it stored");
                }
            }
        }
        Ok(relayed)
    }

    async fn delete(&mut self, commands: &CommandChannel, index: u32) {
        match commands.run_ok(&at::delete_sms(index)).await {
            Ok(_) => {
                self.undeleted.remove(&index);
            }
            Err(e) => {
                tracing::warn!(index, error = %e, "could not delete relayed SMS");
                self.undeleted.insert(index);
            }
        }
    }
}
