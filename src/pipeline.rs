use crate::command::Command;
use crate::connection::{Connection, InFlight};
use crate::error::{ClientError, ClientResult, TransactionError};
use crate::pool::Pool;
use crate::resp::RespValue;
use std::fmt::Display;
use tracing::debug;

/// Called with a command's own reply as soon as it is decoded.
pub type ReplyCallback = Box<dyn FnOnce(ClientResult<RespValue>) + Send>;

#[derive(Debug, Clone)]
enum Target {
    Connection(Connection),
    Pool(Pool),
}

impl Target {
    async fn checkout(&self) -> ClientResult<InFlight> {
        match self {
            Target::Connection(conn) => conn.checkout().await,
            Target::Pool(pool) => pool.checkout().await,
        }
    }
}

struct Queued {
    want_object: bool,
    callback: Option<ReplyCallback>,
}

/// Accumulates commands and writes them in a single batch on `send`.
///
/// Replies are read back in order and each command's callback fires as its
/// reply arrives. A batch that starts with MULTI and ends with EXEC resolves
/// to the EXEC result instead of the per-command acks.
///
/// ```no_run
/// # async fn example(conn: respool::connection::Connection) -> respool::error::ClientResult<()> {
/// let mut pipeline = conn.pipeline();
/// pipeline.enqueue(["SET", "k1", "v1"], false).enqueue(["GET", "k1"], false);
/// let replies = pipeline.send().await?;
/// assert_eq!(replies.len(), 2);
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    target: Target,
    buf: Vec<u8>,
    queued: Vec<Queued>,
    /// The first queued command was MULTI.
    transaction_start: bool,
    /// The last queued command was EXEC.
    transaction_close: bool,
    transaction_open: bool,
    auto_close: bool,
}

impl Pipeline {
    pub(crate) fn for_connection(conn: Connection) -> Self {
        let auto_close = conn.config().auto_close_transactions;
        Pipeline::new(Target::Connection(conn), auto_close)
    }

    pub(crate) fn for_pool(pool: Pool) -> Self {
        let auto_close = pool.config().auto_close_transactions;
        Pipeline::new(Target::Pool(pool), auto_close)
    }

    fn new(target: Target, auto_close: bool) -> Self {
        Pipeline {
            target,
            buf: Vec::new(),
            queued: Vec::new(),
            transaction_start: false,
            transaction_close: false,
            transaction_open: false,
            auto_close,
        }
    }

    pub(crate) fn begin_transaction(mut self) -> Self {
        self.queue(Command::new("MULTI"), false, None);
        self
    }

    /// Queue a command. MULTI and EXEC update the pipeline's transaction
    /// bookkeeping whichever way they are queued.
    pub fn queue(
        &mut self,
        command: impl Into<Command>,
        want_object: bool,
        callback: Option<ReplyCallback>,
    ) -> &mut Self {
        let command = command.into();
        if command.is("MULTI") {
            if self.queued.is_empty() {
                self.transaction_start = true;
            }
            self.transaction_open = true;
        }
        self.transaction_close = command.is("EXEC");
        if self.transaction_close {
            self.transaction_open = false;
        }

        self.buf.extend_from_slice(&command.encode());
        self.queued.push(Queued {
            want_object,
            callback,
        });
        self
    }

    pub fn enqueue<I, T>(&mut self, tokens: I, want_object: bool) -> &mut Self
    where
        I: IntoIterator<Item = T>,
        T: Display,
    {
        self.queue(Command::from_tokens(tokens), want_object, None)
    }

    pub fn enqueue_with<I, T, F>(&mut self, tokens: I, want_object: bool, callback: F) -> &mut Self
    where
        I: IntoIterator<Item = T>,
        T: Display,
        F: FnOnce(ClientResult<RespValue>) + Send + 'static,
    {
        self.queue(Command::from_tokens(tokens), want_object, Some(Box::new(callback)))
    }

    /// Queue MULTI. Fails if this pipeline already has an open transaction.
    pub fn multi(&mut self) -> Result<&mut Self, TransactionError> {
        if self.transaction_open {
            return Err(TransactionError::NestedMulti);
        }
        Ok(self.queue(Command::new("MULTI"), false, None))
    }

    pub fn exec(&mut self) -> &mut Self {
        self.queue(Command::new("EXEC"), false, None)
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// The batch is a MULTI ... EXEC block and resolves to the EXEC result.
    pub fn is_transaction(&self) -> bool {
        self.transaction_start && self.transaction_close
    }

    /// Send the batch and return the aggregate: every reply in order, or the
    /// elements of the EXEC result for a transaction. Error replies stay in
    /// place as `RespValue::Error`.
    pub async fn send(self) -> ClientResult<Vec<RespValue>> {
        self.dispatch().await
    }

    /// Send the batch and pick one element of the aggregate. Negative
    /// indices count from the end; out of range yields `None`.
    pub async fn send_at(self, index: isize) -> ClientResult<Option<RespValue>> {
        let mut aggregate = self.dispatch().await?;
        let len = aggregate.len() as isize;
        let index = if index < 0 { len + index } else { index };
        if index < 0 || index >= len {
            return Ok(None);
        }
        Ok(Some(aggregate.swap_remove(index as usize)))
    }

    async fn dispatch(mut self) -> ClientResult<Vec<RespValue>> {
        if self.queued.is_empty() {
            return Ok(Vec::new());
        }
        if self.transaction_open && self.auto_close {
            self.exec();
        }

        let modes: Vec<bool> = self.queued.iter().map(|q| q.want_object).collect();
        let mut callbacks: Vec<Option<ReplyCallback>> =
            self.queued.into_iter().map(|q| q.callback).collect();
        let mut replies = Vec::with_capacity(modes.len());

        let mut slot = self.target.checkout().await?;
        debug!(
            "Connection {} sending pipeline of {} commands",
            slot.connection().id(),
            modes.len()
        );
        slot.exchange(&self.buf, &modes, |index, result| {
            let callback = callbacks.get_mut(index).and_then(Option::take);
            let value = match &result {
                Ok(value) => value.clone(),
                Err(ClientError::Redis(message)) => RespValue::Error(message.clone()),
                Err(err) => RespValue::Error(err.to_string()),
            };
            if let Some(callback) = callback {
                callback(result);
            }
            replies.push(value);
        })
        .await?;
        drop(slot);

        if !(self.transaction_start && self.transaction_close) {
            return Ok(replies);
        }
        match replies.pop() {
            Some(RespValue::Array(Some(items))) => Ok(items),
            Some(RespValue::Array(None)) => Err(TransactionError::Aborted.into()),
            Some(RespValue::Error(message)) => Err(ClientError::Redis(message)),
            other => Err(TransactionError::UnexpectedReply(format!("{other:?}")).into()),
        }
    }
}
