//! Optimistic send, update, resend and delete for [`MessageStream`].
//!
//! Every operation is applied to the store before the backend is asked,
//! then settled when the backend answers: a success replaces the optimistic
//! message with the server's copy, a failure leaves it visible as failed.
//! Results that resolve after a reset are dropped.

use tokio::sync::OwnedMutexGuard;

use chatline_proto::message::{
    Message, MessageDraft, MessageId, MessageKey, MessageStatus, Payload, RequestId, Timestamp,
};

use crate::backend::{BackendError, ChannelBackend};
use crate::bus::StreamEvent;

use super::pending::{Operation, OperationState, ResendRefusal};
use super::{MessageStream, OperationError};

type ChainGuard = Option<OwnedMutexGuard<()>>;

/// Where a backend result landed once it came back.
enum Settled<T> {
    /// Applied to the current view.
    Applied(T),
    /// The message left the view meanwhile; nothing to apply.
    Absent,
    /// A reset happened meanwhile.
    Stale,
}

impl<B: ChannelBackend> MessageStream<B> {
    /// Send a new message.
    ///
    /// The message appears immediately under a temporary
    /// [`MessageKey::Local`] key with [`MessageStatus::Pending`]. On success it
    /// is replaced by the server's message; on failure it stays in place with
    /// [`MessageStatus::Failed`] and can be retried with
    /// [`resend_message`](Self::resend_message).
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::Validation`] without touching the store if the
    /// draft is invalid, or [`OperationError::Backend`] if the send failed.
    pub async fn send_message(&self, draft: MessageDraft) -> Result<Message, OperationError> {
        let draft = (self.before_send)(draft);
        draft.validate()?;

        let request_id = RequestId::new();
        let key = MessageKey::Local(request_id);
        let now = Timestamp::now();
        let placeholder = Message {
            key: key.clone(),
            channel_id: self.channel_id.clone(),
            sender: self.current_user.clone(),
            payload: draft.payload.clone(),
            created_at: now,
            updated_at: now,
            status: MessageStatus::Pending,
            parent: draft.parent.clone(),
            request_id: Some(request_id),
        };

        let (epoch, chain) = self.mutate(|state| {
            state.store.upsert(placeholder.clone());
            state.pending.begin_send(request_id, draft.clone());
            let chain = state.pending.chain(&key).try_lock_owned().ok();
            (state.pagination.epoch(), chain)
        });
        tracing::debug!(channel = %self.channel_id, %request_id, "send started");
        self.publish(StreamEvent::MessageSentPending {
            message: placeholder,
        });

        self.dispatch_send(request_id, &draft, epoch, chain).await
    }

    /// Edit the payload of a message.
    ///
    /// `key` may be the temporary key of a message whose send is still in
    /// flight; the edit then waits for the send and targets the server
    /// identity it was given.
    ///
    /// # Errors
    ///
    /// - [`OperationError::Validation`] if the payload is invalid
    /// - [`OperationError::UnknownMessage`] if the key is not in this view
    /// - [`OperationError::TargetNotConfirmed`] if the send behind `key` failed
    /// - [`OperationError::InFlight`] if another edit is awaiting the server
    /// - [`OperationError::Backend`] if the backend rejected the edit; the
    ///   prior content is restored with a failed status
    pub async fn update_message(
        &self,
        key: &MessageKey,
        payload: Payload,
    ) -> Result<Message, OperationError> {
        let payload = (self.before_update)(payload);
        payload.validate()?;

        let chain = {
            let mut state = self.state.lock();
            if !state.store.contains(key) && state.pending.resolve(key).is_none() {
                return Err(OperationError::UnknownMessage(key.clone()));
            }
            state.pending.chain(key)
        };
        let _queued = chain.lock_owned().await;

        let (target, server_chain) = {
            let mut state = self.state.lock();
            let target = state
                .pending
                .resolve(key)
                .ok_or_else(|| OperationError::TargetNotConfirmed(key.clone()))?;
            let server_chain = key
                .is_local()
                .then(|| state.pending.chain(&MessageKey::Server(target.clone())));
            (target, server_chain)
        };
        let _server_queued = match server_chain {
            Some(chain) => Some(chain.lock_owned().await),
            None => None,
        };

        let server_key = MessageKey::Server(target.clone());
        let (previous, epoch, optimistic) = self.mutate(|state| {
            if state.pending.state(&server_key) == Some(&OperationState::Pending) {
                return Err(OperationError::InFlight(server_key.clone()));
            }
            let current = state
                .store
                .get(&server_key)
                .ok_or_else(|| OperationError::UnknownMessage(key.clone()))?;
            let previous = match state.pending.record(&server_key).map(|r| &r.operation) {
                Some(Operation::Update { previous, .. }) => previous.clone(),
                _ => current.payload.clone(),
            };
            state
                .pending
                .begin_update(target.clone(), payload.clone(), previous.clone());
            state.store.modify(&server_key, |message| {
                message.payload = payload.clone();
                message.status = MessageStatus::Pending;
            });
            let optimistic = state.store.get(&server_key).cloned();
            Ok((previous, state.pagination.epoch(), optimistic))
        })?;
        tracing::debug!(channel = %self.channel_id, message_id = %target, "update started");
        if let Some(message) = optimistic {
            self.publish(StreamEvent::MessagesUpdated {
                messages: vec![message],
            });
        }

        self.dispatch_update(target, &payload, previous, epoch).await
    }

    /// Retry a failed send or update with its original content.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::UnknownMessage`] if nothing is tracked for
    /// `key`, [`OperationError::NotRetryable`] if its operation has not
    /// failed, or [`OperationError::Backend`] if the retry failed again.
    pub async fn resend_message(&self, key: &MessageKey) -> Result<Message, OperationError> {
        let (operation, epoch, chain, pending) = self.mutate(|state| {
            let operation = state.pending.begin_resend(key).map_err(|refusal| match refusal {
                ResendRefusal::Unknown => OperationError::UnknownMessage(key.clone()),
                ResendRefusal::NotFailed => OperationError::NotRetryable(key.clone()),
            })?;
            let payload = match &operation {
                Operation::Send { draft, .. } => draft.payload.clone(),
                Operation::Update { payload, .. } => payload.clone(),
            };
            state.store.modify(key, |message| {
                message.payload = payload;
                message.status = MessageStatus::Pending;
            });
            let chain = state.pending.chain(key).try_lock_owned().ok();
            let pending = state.store.get(key).cloned();
            Ok::<_, OperationError>((operation, state.pagination.epoch(), chain, pending))
        })?;
        tracing::info!(channel = %self.channel_id, %key, "resending failed operation");

        match operation {
            Operation::Send { request_id, draft } => {
                if let Some(message) = pending {
                    self.publish(StreamEvent::MessageSentPending { message });
                }
                self.dispatch_send(request_id, &draft, epoch, chain).await
            }
            Operation::Update {
                target,
                payload,
                previous,
            } => {
                if let Some(message) = pending {
                    self.publish(StreamEvent::MessagesUpdated {
                        messages: vec![message],
                    });
                }
                let _chain = chain;
                self.dispatch_update(target, &payload, previous, epoch).await
            }
        }
    }

    /// Delete a message.
    ///
    /// A message that never reached the server is removed locally. A
    /// server message is deleted through the backend and removed once the
    /// backend confirms.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::InFlight`] while a send or edit of the
    /// message awaits the server, [`OperationError::UnknownMessage`] if the
    /// key is not in this view, or [`OperationError::Backend`] if the backend
    /// refused; the message then stays in place.
    pub async fn delete_message(&self, key: &MessageKey) -> Result<(), OperationError> {
        let plan = self.mutate(|state| {
            let target = state.pending.resolve(key);
            let stored_key = target.clone().map_or_else(|| key.clone(), MessageKey::Server);
            if state.pending.state(&stored_key) == Some(&OperationState::Pending) {
                return Err(OperationError::InFlight(key.clone()));
            }
            if !state.store.contains(&stored_key) {
                return Err(OperationError::UnknownMessage(key.clone()));
            }
            match target {
                Some(id) => Ok(Some((id, state.pagination.epoch()))),
                None => {
                    state.store.remove(&stored_key);
                    state.pending.forget(&stored_key);
                    Ok(None)
                }
            }
        })?;

        let Some((target, epoch)) = plan else {
            tracing::debug!(channel = %self.channel_id, %key, "removed unsent message");
            self.publish(StreamEvent::MessagesDeleted {
                keys: vec![key.clone()],
            });
            return Ok(());
        };

        if let Err(error) = self.backend.delete_message(&target).await {
            tracing::warn!(message_id = %target, %error, "delete failed");
            return Err(error.into());
        }

        let server_key = MessageKey::Server(target);
        let removed = self.mutate(|state| {
            if state.pagination.epoch() != epoch {
                return None;
            }
            state.pending.forget(&server_key);
            Some(state.store.remove(&server_key).is_some())
        });
        match removed {
            None => self.note_stale("delete_message"),
            Some(true) => self.publish(StreamEvent::MessagesDeleted {
                keys: vec![server_key],
            }),
            Some(false) => {}
        }
        Ok(())
    }

    async fn dispatch_send(
        &self,
        request_id: RequestId,
        draft: &MessageDraft,
        epoch: u64,
        _chain: ChainGuard,
    ) -> Result<Message, OperationError> {
        let key = MessageKey::Local(request_id);
        let result = self
            .backend
            .send_message(&self.channel_id, request_id, draft)
            .await
            .and_then(|message| match message.key.as_server() {
                Some(id) => Ok((id.clone(), message)),
                None => Err(BackendError::InvalidResponse(
                    "sent message has no server identifier".into(),
                )),
            });

        match result {
            Ok((server_id, mut message)) => {
                message.status = MessageStatus::Succeeded;
                let settled = self.mutate(|state| {
                    if state.pagination.epoch() != epoch {
                        return Settled::Stale;
                    }
                    state.pending.complete_send(request_id, server_id.clone());
                    // A live echo may have replaced the placeholder already.
                    if state.store.remove(&key).is_none() {
                        return Settled::Absent;
                    }
                    state.store.upsert(message.clone());
                    Settled::Applied(())
                });
                if matches!(settled, Settled::Stale) {
                    self.note_stale("send_message");
                }
                tracing::info!(%request_id, message_id = %server_id, "send confirmed");
                self.publish(StreamEvent::MessageSentSuccess {
                    request_id,
                    message: message.clone(),
                });
                Ok(message)
            }
            Err(error) => {
                let reason = error.to_string();
                tracing::warn!(%request_id, %reason, "send failed");
                let settled = self.mutate(|state| {
                    if state.pagination.epoch() != epoch {
                        return Settled::Stale;
                    }
                    if !state.pending.fail(&key, reason.clone()) {
                        return Settled::Absent;
                    }
                    state.store.modify(&key, |message| {
                        message.status = MessageStatus::Failed(reason.clone());
                    });
                    state.store.get(&key).cloned().map_or(Settled::Absent, Settled::Applied)
                });
                match settled {
                    Settled::Applied(message) => {
                        self.publish(StreamEvent::MessageSendFailed { message, reason });
                    }
                    Settled::Absent => {
                        tracing::debug!(%request_id, "send already confirmed by its live echo");
                    }
                    Settled::Stale => self.note_stale("send_message"),
                }
                Err(error.into())
            }
        }
    }

    async fn dispatch_update(
        &self,
        target: MessageId,
        payload: &Payload,
        previous: Payload,
        epoch: u64,
    ) -> Result<Message, OperationError> {
        let key = MessageKey::Server(target.clone());
        match self.backend.update_message(&target, payload).await {
            Ok(mut message) => {
                message.status = MessageStatus::Succeeded;
                let settled = self.mutate(|state| {
                    if state.pagination.epoch() != epoch {
                        return Settled::Stale;
                    }
                    state.pending.complete(&key);
                    if !state.store.contains(&key) {
                        return Settled::Absent;
                    }
                    state.store.upsert(message.clone());
                    Settled::Applied(())
                });
                match settled {
                    Settled::Applied(()) => {
                        tracing::info!(message_id = %target, "update confirmed");
                        self.publish(StreamEvent::MessagesUpdated {
                            messages: vec![message.clone()],
                        });
                    }
                    Settled::Absent => {
                        tracing::debug!(message_id = %target, "update confirmed after the message was removed");
                    }
                    Settled::Stale => self.note_stale("update_message"),
                }
                Ok(message)
            }
            Err(error) => {
                let reason = error.to_string();
                tracing::warn!(message_id = %target, %reason, "update failed");
                let settled = self.mutate(|state| {
                    if state.pagination.epoch() != epoch {
                        return Settled::Stale;
                    }
                    if !state.store.contains(&key) {
                        state.pending.forget(&key);
                        return Settled::Absent;
                    }
                    state.pending.fail(&key, reason.clone());
                    state.store.modify(&key, |message| {
                        message.payload = previous;
                        message.status = MessageStatus::Failed(reason.clone());
                    });
                    state.store.get(&key).cloned().map_or(Settled::Absent, Settled::Applied)
                });
                match settled {
                    Settled::Applied(message) => {
                        self.publish(StreamEvent::MessageUpdateFailed { message, reason });
                    }
                    Settled::Absent => {
                        tracing::debug!(message_id = %target, "update failed after the message was removed");
                    }
                    Settled::Stale => self.note_stale("update_message"),
                }
                Err(error.into())
            }
        }
    }
}
