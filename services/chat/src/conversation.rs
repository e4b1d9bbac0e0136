//! A chat session on top of the relay: keeps the transcript, streams turns and
//! resends the conversation when answered approvals call for it.

use crate::transcript::Transcript;
use chatrelay_core::{ResubmitGuard, Role, StreamChunk};
use chatrelay_realtime::{RelayClient, Result};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What a call into the session produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exchange {
    /// Turns streamed, automatic resends included.
    pub turns: usize,
    pub cancelled: bool,
}

pub struct ChatSession {
    client: RelayClient,
    transcript: Transcript,
    guard: ResubmitGuard,
}

impl ChatSession {
    pub fn new(client: RelayClient) -> Self {
        Self {
            client,
            transcript: Transcript::new(),
            guard: ResubmitGuard::new(),
        }
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn client(&self) -> &RelayClient {
        &self.client
    }

    /// Sends a user message and streams the reply.
    pub async fn say<F>(
        &mut self,
        text: &str,
        cancel: Option<CancellationToken>,
        on_chunk: F,
    ) -> Result<Exchange>
    where
        F: FnMut(&StreamChunk),
    {
        if let Some(previous) = self.transcript.last().filter(|m| m.role == Role::Assistant) {
            self.guard.evict_turn(&previous.id);
        }
        self.transcript.push_user(text);
        self.run_turns(cancel, on_chunk).await
    }

    /// Records a decision on a pending approval and resends the conversation
    /// when that resolves the turn. `None` when nothing waits on `approval_id`.
    pub async fn answer_approval<F>(
        &mut self,
        approval_id: &str,
        approved: bool,
        reason: Option<String>,
        cancel: Option<CancellationToken>,
        on_chunk: F,
    ) -> Result<Option<Exchange>>
    where
        F: FnMut(&StreamChunk),
    {
        if !self.transcript.respond_approval(approval_id, approved, reason) {
            return Ok(None);
        }
        if !self.guard.should_resubmit(self.transcript.messages()) {
            debug!(approval_id, "approval recorded; waiting for the remaining decisions");
            return Ok(Some(Exchange {
                turns: 0,
                cancelled: false,
            }));
        }
        info!(approval_id, "approvals resolved; resending conversation");
        self.run_turns(cancel, on_chunk).await.map(Some)
    }

    pub fn interrupt(&self, reason: Option<String>) {
        self.client.interrupt(reason);
    }

    pub async fn close(&mut self) {
        self.client.close().await;
    }

    /// Streams one turn, then keeps resending while the decision engine
    /// asks for it.
    async fn run_turns<F>(&mut self, cancel: Option<CancellationToken>, mut on_chunk: F) -> Result<Exchange>
    where
        F: FnMut(&StreamChunk),
    {
        let mut turns = 0;
        loop {
            self.stream_turn(cancel.clone(), &mut on_chunk).await?;
            turns += 1;

            let cancelled = cancel.as_ref().is_some_and(CancellationToken::is_cancelled);
            if cancelled || !self.guard.should_resubmit(self.transcript.messages()) {
                return Ok(Exchange { turns, cancelled });
            }
            info!(turns, "resending conversation after client-side tool completion");
        }
    }

    async fn stream_turn<F>(&mut self, cancel: Option<CancellationToken>, on_chunk: &mut F) -> Result<()>
    where
        F: FnMut(&StreamChunk),
    {
        let messages = self.transcript.messages().to_vec();
        let mut stream = self.client.send(messages, cancel).await?;
        while let Some(item) = stream.next().await {
            let chunk = item?;
            self.transcript.apply(&chunk);
            on_chunk(&chunk);
        }
        Ok(())
    }
}
