//! Extended query command.
//!
//! A [`Command`] is created without any io. On first consumption it acquires a [`Lease`]
//! from its executor and send the whole pipeline in one write:
//!
//! ```text
//! Parse -> Bind -> Describe(portal) -> Execute -> Close(portal) -> Sync
//! ```
//!
//! then expect the backend responses:
//!
//! ```text
//! ParseComplete -> BindComplete -> RowDescription -> DataRow* -> CommandComplete -> CloseComplete -> ReadyForQuery
//!                                  NoData -> CommandComplete | EmptyQueryResponse -> CloseComplete -> ReadyForQuery
//! ```
//!
//! On error, the remaining messages are drained until `ReadyForQuery` before the lease is released.
use bytes::Bytes;
use futures_core::Stream;
use std::{
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};

use crate::{
    Error, Result,
    common::{span, verbose},
    postgres::{
        BackendMessage, ColumnDescription, ReadyState, UnexpectedMessage,
        backend::{CommandComplete, ParseComplete, BindComplete, CloseComplete, DataRow, NoData, ReadyForQuery, RowDescription, EmptyQueryResponse},
        frontend::{Bind, Close, Describe, Execute, Parse, Query, Sync},
    },
    row::Row,
    transport::{Lease, PgTransport, PgTransportExt},
};

/// Future returned by an executor to acquire a lease.
pub type LeaseFuture<L> = Pin<Box<dyn Future<Output = Result<L>> + Send>>;

/// Row mapper, applied to each received row.
pub type Mapper<T> = Box<dyn FnMut(Row) -> T + Send>;

/// Expected next backend message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    ParseComplete,
    BindComplete,
    Describe,
    /// after `NoData`
    Complete,
    /// after `RowDescription`
    Rows,
    CloseComplete,
    Ready,
}

impl Step {
    fn expected(self) -> &'static [u8] {
        const DESCRIBE: &[u8] = &[RowDescription::MSGTYPE, NoData::MSGTYPE];
        const COMPLETE: &[u8] = &[CommandComplete::MSGTYPE, EmptyQueryResponse::MSGTYPE];
        const ROWS: &[u8] = &[CommandComplete::MSGTYPE, DataRow::MSGTYPE];

        match self {
            Step::ParseComplete => &[ParseComplete::MSGTYPE],
            Step::BindComplete => &[BindComplete::MSGTYPE],
            Step::Describe => DESCRIBE,
            Step::Complete => COMPLETE,
            Step::Rows => ROWS,
            Step::CloseComplete => &[CloseComplete::MSGTYPE],
            Step::Ready => &[ReadyForQuery::MSGTYPE],
        }
    }
}

enum State<L> {
    /// Query captured, nothing sent.
    Idle {
        acquire: LeaseFuture<L>,
    },
    /// Pipeline sent, waiting for the statement to be described.
    Init {
        lease: L,
        step: Step,
    },
    /// Rows are being received.
    Running {
        lease: L,
        fields: Arc<[ColumnDescription]>,
        step: Step,
    },
    /// Error occured, waiting for `ReadyForQuery` before returning the error.
    Drain {
        lease: L,
        error: Error,
    },
    /// Lease released.
    Closed {
        ready: Option<ReadyState>,
    },
    /// Only during transition.
    Invalid,
}

impl<L> State<L> {
    fn name(&self) -> &'static str {
        match self {
            State::Idle { .. } => "Idle",
            State::Init { .. } => "Init",
            State::Running { .. } => "Running",
            State::Drain { .. } => "Drain",
            State::Closed { .. } => "Closed",
            State::Invalid => "Invalid",
        }
    }
}

/// Outcome of one received message.
enum Event {
    Row(Row),
    Described,
    Done,
    Continue,
}

struct Machine<L: Lease> {
    sql: String,
    params: Vec<Option<Bytes>>,
    state: State<L>,
    complete: Option<CommandComplete>,
}

impl<L: Lease> Machine<L> {
    fn send_pipeline(&self, lease: &mut L) -> Result<()> {
        span!("pipeline");
        verbose!(sql = %self.sql, params = self.params.len(), "sending");

        let io = lease.transport();
        io.send(Parse { prepare_name: "", sql: &self.sql, oids: &[] }.into())?;
        io.send(Bind {
            portal_name: "",
            stmt_name: "",
            param_formats: &[],
            params: &self.params,
            result_formats: &[],
        }.into())?;
        io.send(Describe { kind: b'P', name: "" }.into())?;
        io.send(Execute { portal_name: "", max_row: 0 }.into())?;
        io.send(Close { variant: b'P', name: "" }.into())?;
        io.send(Sync.into())?;
        Ok(())
    }

    /// Release the lease and enter `Closed`.
    ///
    /// Returns the pending error if the command was draining.
    fn release(&mut self, ready: Option<ReadyState>) -> Option<Error> {
        let (lease, error) = match std::mem::replace(&mut self.state, State::Closed { ready }) {
            State::Init { lease, .. } | State::Running { lease, .. } => (lease, None),
            State::Drain { lease, error } => (lease, Some(error)),
            _ => return None,
        };
        verbose!(?ready, "released");
        lease.release(ready);
        error
    }

    /// Handle error in the middle of the sequence, drain until `ReadyForQuery`.
    fn fail(&mut self, error: Error) -> Result<Event> {
        match std::mem::replace(&mut self.state, State::Invalid) {
            State::Init { lease, .. } | State::Running { lease, .. } => {
                self.state = State::Drain { lease, error };
            },
            state => self.state = state,
        }
        Ok(Event::Continue)
    }

    fn poll_event(&mut self, cx: &mut Context) -> Poll<Result<Event>> {
        let lease = match &mut self.state {
            State::Idle { acquire } => {
                let result = ready!(acquire.as_mut().poll(cx));
                let mut lease = match result {
                    Ok(ok) => ok,
                    Err(err) => {
                        self.state = State::Closed { ready: None };
                        return Poll::Ready(Err(err));
                    },
                };

                if let Err(err) = self.send_pipeline(&mut lease) {
                    lease.release(None);
                    self.state = State::Closed { ready: None };
                    return Poll::Ready(Err(err));
                }

                self.state = State::Init { lease, step: Step::ParseComplete };
                return Poll::Ready(Ok(Event::Continue));
            },
            State::Init { lease, .. } | State::Running { lease, .. } | State::Drain { lease, .. } => lease,
            State::Closed { .. } => return Poll::Ready(Ok(Event::Done)),
            State::Invalid => unreachable!("command state is invalid"),
        };

        let message = match ready!(lease.transport().poll_message(cx)) {
            Ok(ok) => ok,
            Err(err) => {
                // framing trust is lost, no draining
                let drained = self.release(None);
                return Poll::Ready(Err(drained.unwrap_or(err)));
            },
        };

        verbose!(state = self.state.name(), msgtype = ?char::from(message.msgtype()), "recv");

        Poll::Ready(self.on_message(message))
    }

    fn on_message(&mut self, message: BackendMessage) -> Result<Event> {
        if let State::Drain { .. } = self.state {
            if let BackendMessage::ReadyForQuery(ready) = message {
                let State::Drain { lease, error } = std::mem::replace(&mut self.state, State::Closed { ready: Some(ready.state) }) else {
                    unreachable!()
                };
                verbose!(ready = ?ready.state, "drained");
                lease.release(Some(ready.state));
                return Err(error);
            }
            return Ok(Event::Continue);
        }

        let step = match &mut self.state {
            State::Init { step, .. } | State::Running { step, .. } => step,
            _ => unreachable!("message received without lease"),
        };

        use BackendMessage as B;
        match (*step, message) {
            (Step::ParseComplete, B::ParseComplete(_)) => *step = Step::BindComplete,
            (Step::BindComplete, B::BindComplete(_)) => *step = Step::Describe,
            (Step::Describe, B::NoData(_)) => *step = Step::Complete,
            (Step::Describe, B::RowDescription(rd)) => {
                let State::Init { lease, .. } = std::mem::replace(&mut self.state, State::Invalid) else {
                    unreachable!()
                };
                self.state = State::Running { lease, fields: rd.fields.into(), step: Step::Rows };
                return Ok(Event::Described);
            },
            (Step::Complete, B::EmptyQueryResponse(_)) => *step = Step::CloseComplete,
            (Step::Complete | Step::Rows, B::CommandComplete(cmd)) => {
                *step = Step::CloseComplete;
                self.complete = Some(cmd);
            },
            (Step::Rows, B::DataRow(data)) => {
                let State::Running { fields, .. } = &self.state else {
                    unreachable!()
                };
                return match Row::new(fields.clone(), data.values) {
                    Ok(row) => Ok(Event::Row(row)),
                    Err(err) => self.fail(err.into()),
                };
            },
            (Step::CloseComplete, B::CloseComplete(_)) => *step = Step::Ready,
            (Step::Ready, B::ReadyForQuery(ready)) => {
                self.release(Some(ready.state));
                return Ok(Event::Done);
            },
            (_, B::ErrorResponse(err)) => return self.fail(err.error.into()),
            (step, B::ReadyForQuery(_)) => {
                // buffered messages of the abandoned steps are left behind, the owner must resync
                self.release(None);
                let error = UnexpectedMessage::new(ReadyForQuery::MSGTYPE, step.expected());
                return Err(error.into());
            },
            (step, message) => {
                let error = UnexpectedMessage::new(message.msgtype(), step.expected());
                return self.fail(error.into());
            },
        }

        Ok(Event::Continue)
    }

    fn poll_row(&mut self, cx: &mut Context) -> Poll<Result<Option<Row>>> {
        loop {
            match ready!(self.poll_event(cx)?) {
                Event::Row(row) => return Poll::Ready(Ok(Some(row))),
                Event::Done => return Poll::Ready(Ok(None)),
                Event::Described | Event::Continue => { },
            }
        }
    }

    /// Poll until rows are available or the command ends.
    ///
    /// Returns `true` if the statement returns rows.
    fn poll_start(&mut self, cx: &mut Context) -> Poll<Result<bool>> {
        loop {
            match self.state {
                State::Running { .. } => return Poll::Ready(Ok(true)),
                State::Closed { .. } => return Poll::Ready(Ok(false)),
                _ => { },
            }
            match ready!(self.poll_event(cx)?) {
                Event::Row(_) => unreachable!("row received before described"),
                Event::Described | Event::Continue | Event::Done => { },
            }
        }
    }

    fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed { .. })
    }
}

impl<L: Lease> Drop for Machine<L> {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.state, State::Invalid) {
            State::Init { mut lease, .. } | State::Running { mut lease, .. } | State::Drain { mut lease, .. } => {
                // the owner drain the rest before next use
                lease.transport().ready_request();
                lease.release(None);
            },
            _ => { },
        }
    }
}

/// A single query using the extended query protocol.
///
/// Rows are mapped with the mapper, which defaults to return the [`Row`] itself.
///
/// Created by [`Executor::query`][crate::Executor::query].
pub struct Command<L: Lease, T = Row> {
    machine: Machine<L>,
    mapper: Mapper<T>,
}

impl<L: Lease> Command<L, Row> {
    /// Create command which will acquire its lease from `acquire`.
    pub fn new(sql: impl Into<String>, acquire: LeaseFuture<L>) -> Self {
        Self {
            machine: Machine {
                sql: sql.into(),
                params: vec![],
                state: State::Idle { acquire },
                complete: None,
            },
            mapper: Box::new(|row| row),
        }
    }
}

impl<L: Lease, T> Command<L, T> {
    /// Bind a parameter in text format.
    ///
    /// Has no effect once the command started.
    pub fn bind(mut self, value: impl fmt::Display) -> Self {
        self.machine.params.push(Some(Bytes::from(value.to_string())));
        self
    }

    /// Bind a raw text value.
    pub fn bind_bytes(mut self, value: impl Into<Bytes>) -> Self {
        self.machine.params.push(Some(value.into()));
        self
    }

    /// Bind a NULL parameter.
    pub fn bind_null(mut self) -> Self {
        self.machine.params.push(None);
        self
    }

    /// Compose the row mapper.
    pub fn map<U, F>(self, mut f: F) -> Command<L, U>
    where
        F: FnMut(T) -> U + Send + 'static,
        T: 'static,
    {
        let Self { machine, mut mapper } = self;
        Command { machine, mapper: Box::new(move |row| f(mapper(row))) }
    }

    /// Returns the query string.
    pub fn sql(&self) -> &str {
        &self.machine.sql
    }

    /// Returns `true` if the command lease is released.
    pub fn is_closed(&self) -> bool {
        self.machine.is_closed()
    }

    /// Returns the final `ReadyForQuery` state if the command ended normally.
    pub fn ready_state(&self) -> Option<ReadyState> {
        match self.machine.state {
            State::Closed { ready } => ready,
            _ => None,
        }
    }

    /// Returns the `CommandComplete` tag once received.
    pub fn tag(&self) -> Option<&str> {
        self.machine.complete.as_ref().map(|e| e.tag.as_str())
    }

    /// Returns the number of rows affected once the command completed.
    pub fn rows_affected(&self) -> Option<u64> {
        self.machine.complete.as_ref().map(CommandComplete::rows_affected)
    }

    /// Poll the next mapped row.
    pub fn poll_row(&mut self, cx: &mut Context) -> Poll<Result<Option<T>>> {
        let row = ready!(self.machine.poll_row(cx)?);
        Poll::Ready(Ok(row.map(&mut self.mapper)))
    }

    /// Start the command if not yet started and wait until rows are available.
    ///
    /// Returns `false` if the statement does not return rows, or the command is already closed.
    pub async fn start(&mut self) -> Result<bool> {
        if self.machine.is_closed() {
            return Ok(false);
        }
        std::future::poll_fn(|cx| self.machine.poll_start(cx)).await
    }

    /// Fetch the next mapped row.
    pub async fn next_row(&mut self) -> Result<Option<T>> {
        std::future::poll_fn(|cx| self.poll_row(cx)).await
    }

    /// Fetch all rows.
    ///
    /// Returns `None` if the statement does not return rows, like `INSERT` without `RETURNING`,
    /// or if the command is already closed.
    pub async fn fetch_all(&mut self) -> Result<Option<Vec<T>>> {
        if !self.start().await? {
            // statement may returns `NoData`, ensure released
            self.close().await?;
            return Ok(None);
        }

        let mut rows = vec![];
        while let Some(row) = self.next_row().await? {
            rows.push(row);
        }
        Ok(Some(rows))
    }

    /// Fetch the first row, the rest is discarded.
    ///
    /// Returns `None` if there is no row, or the command is already closed.
    pub async fn fetch_one(&mut self) -> Result<Option<T>> {
        if self.machine.is_closed() {
            return Ok(None);
        }
        let row = self.next_row().await?;
        self.close().await?;
        Ok(row)
    }

    /// Execute the command and discard all rows.
    ///
    /// Returns the number of rows affected.
    pub async fn execute(&mut self) -> Result<u64> {
        while std::future::poll_fn(|cx| self.machine.poll_row(cx)).await?.is_some() { }
        Ok(self.rows_affected().unwrap_or_default())
    }

    /// Drain the command until `ReadyForQuery` and release the lease.
    ///
    /// If the command was never started, it is closed without being sent.
    pub async fn close(&mut self) -> Result<()> {
        if let State::Idle { .. } = self.machine.state {
            self.machine.state = State::Closed { ready: None };
            return Ok(());
        }
        while !self.machine.is_closed() {
            std::future::poll_fn(|cx| self.machine.poll_event(cx)).await?;
        }
        Ok(())
    }
}

impl<L: Lease, T> Stream for Command<L, T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_row(cx).map(Result::transpose)
    }
}

impl<L: Lease, T> fmt::Debug for Command<L, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("sql", &self.machine.sql)
            .field("params", &self.machine.params.len())
            .field("state", &self.machine.state.name())
            .finish()
    }
}

/// Run `sql` using the simple query protocol, the returned rows are discarded.
///
/// `sql` may contain multiple statements and cannot have parameters. The first error
/// is returned after `ReadyForQuery`, then the lease is released with its state.
pub async fn simple_query<L: Lease>(mut lease: L, sql: &str) -> Result<ReadyState> {
    verbose!(sql, "simple query");

    let io = lease.transport();
    if let Err(err) = io.send(Query { sql }.into()) {
        lease.release(None);
        return Err(err.into());
    }

    let mut error = None::<Error>;

    loop {
        let message = match lease.transport().message().await {
            Ok(ok) => ok,
            Err(err) => {
                lease.release(None);
                return Err(err);
            },
        };

        use BackendMessage as B;
        match message {
            B::ReadyForQuery(ready) => {
                lease.release(Some(ready.state));
                return match error {
                    Some(err) => Err(err),
                    None => Ok(ready.state),
                };
            },
            B::ErrorResponse(err) => {
                error.get_or_insert(err.error.into());
            },
            B::RowDescription(_) | B::DataRow(_) | B::CommandComplete(_) | B::EmptyQueryResponse(_) => { },
            message => {
                const EXPECTED: &[u8] = &[CommandComplete::MSGTYPE, DataRow::MSGTYPE, ReadyForQuery::MSGTYPE];
                error.get_or_insert(UnexpectedMessage::new(message.msgtype(), EXPECTED).into());
            },
        }
    }
}
