//! The gateway engine.
//!
//! Owns every piece of mutable state the original kept as globals on the
//! `RTX` object: the channel pool, pending callbacks, order/ticket/symbol
//! books, the account model, and the upstream wire connection. Nothing here
//! is `Clone` or `Sync` by design — there is exactly one `Engine`, driven
//! from its own task, and every downstream-facing operation goes through
//! `&mut self`.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, instrument, warn};

use crate::account::AccountModel;
use crate::callback::{CallbackLabel, CallbackRegistry};
use crate::config::GatewayConfig;
use crate::dispatcher::{route_frame, RoutedEvent};
use crate::downstream::{ClientRegistry, DownstreamEvent, DownstreamHub};
use crate::error::GatewayError;
use crate::field::{parse_string, sentinel_reason};
use crate::order::{OrderBook, OrderType};
use crate::pool::ChannelPool;
use crate::position::PositionBook;
use crate::route::{build_order_fields, encode_poke_data, OrderRoute, OrderTicketRequest};
use crate::symbol::{Subscribe, SymbolTable, Unsubscribe};
use crate::ticket::{new_ticket_id, TicketBook};
use crate::wire::{WireClient, WireEvent};
use crate::{ChannelId, ClientId, FieldMap, Result};

const LOGIN_SERVICE: &str = "LOGIN";
const LOGIN_TOPIC: &str = "RTX";
const ACCOUNT_SERVICE: &str = "ACCOUNT_GATEWAY";
const LIVEQUOTE_SERVICE: &str = "TA_SRV";
const LIVEQUOTE_TOPIC: &str = "LIVEQUOTE";
/// Channel binding for every account/order/position query below: all of
/// them multiplex over the single `(ACCOUNT_GATEWAY, ORDER)` channel and
/// differ only in the query table name passed to `request`/`advise`/`poke`.
const ORDER_TOPIC: &str = "ORDER";
const ACCOUNT_TABLE: &str = "ACCOUNT";
const ORDERS_TABLE: &str = "ORDERS";
const POSITION_TABLE: &str = "POSITION";
const ACCOUNT_DATA_TABLE: &str = "DEPOSIT";

/// Messages fed back into the engine's own event loop once a response or
/// streamed update a [`channel::Channel`](crate::channel::Channel) handed
/// out earlier resolves. Bridges the oneshot/mpsc receivers returned from
/// request-issuing methods (which run independently of the `select!` loop)
/// back into `&mut self`-driven handling.
enum EngineEvent {
    Accounts(Result<Vec<Value>>),
    TimeRows(Result<Vec<Value>>),
    /// The one-shot `LIVEQUOTE` snapshot `enable_symbol` requests before it
    /// starts the standing advise, carrying the add-symbol callback's id.
    SymbolInit(String, u64, Result<Vec<Value>>),
    SymbolRow(String, Value),
    OrderRow(Value),
    /// The standing `ORDERS` advise was torn down by the upstream
    /// (`OnTerminate`) rather than by us — fatal per spec'd error handling.
    OrderAdviseTerminated,
    PositionRow(Value),
    AccountData(String, Result<Vec<Value>>),
    CallbackResolved(u64, Result<()>),
}

/// One downstream trading client's request, carried across task boundaries
/// into the engine's own `select!` loop. A listener accepting client
/// sockets never touches `Engine` directly — it only ever holds a clone of
/// the command sender, the same way `wire.rs`'s callers only ever hold a
/// line sender.
pub enum EngineCommand {
    OpenClient { reply: oneshot::Sender<(ClientId, tokio::sync::broadcast::Receiver<DownstreamEvent>)> },
    CloseClient(ClientId),
    SetAccount { account: String, reply: oneshot::Sender<Result<bool>> },
    EnableSymbol { symbol: String, client: ClientId },
    DisableSymbol { symbol: String, client: ClientId },
    SubmitOrder {
        account: String,
        order_type: OrderType,
        symbol: String,
        quantity: i64,
        price: Option<f64>,
        stop_price: Option<f64>,
        reply: oneshot::Sender<Result<String>>,
    },
    ChangeOrder {
        account: String,
        order_type: OrderType,
        symbol: String,
        quantity: i64,
        price: Option<f64>,
        stop_price: Option<f64>,
        refers_to_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    CancelOrder { oid: String },
    GlobalCancel,
    RequestPositions,
    RequestExecutions,
    RequestAccountData { account: String },
}

struct FeedClock {
    feedzone: Tz,
    localzone: Tz,
    last_minute: i64,
}

impl FeedClock {
    fn new(feedzone: Tz, localzone: Tz) -> Self { Self { feedzone, localzone, last_minute: -1 } }

    /// Parses a `$TIME` symbol row (`TRDTIM_1`/`TRD_DATE`) and returns the
    /// `time:` broadcast line once per distinct minute, matching
    /// `handle_time`.
    fn on_time_row(&mut self, row: &FieldMap) -> Result<Option<String>> {
        // Read TRDTIM_1 raw rather than through `parse_string`, which blanks
        // an `Error <code>` sentinel to "" before we get a chance to inspect
        // the code it carries.
        let raw_time = row.get("TRDTIM_1").and_then(Value::as_str).unwrap_or_default().to_string();
        let date_field = row.get("TRD_DATE").map(parse_string).unwrap_or_default();
        if let Some(reason) = sentinel_reason(&raw_time) {
            let code = raw_time.get(6..).map(str::trim).unwrap_or_default();
            if code == "17" {
                return Err(GatewayError::Fatal("$TIME symbol unknown; upstream login has failed".into()));
            }
            return Err(GatewayError::Validation(format!("handle_time: time field {raw_time} ({reason})")));
        }
        let time_field = raw_time;

        let date_parts: Vec<i32> = date_field.splitn(3, '-').filter_map(|p| p.parse().ok()).collect();
        let time_parts: Vec<u32> = time_field.splitn(3, ':').filter_map(|p| p.parse().ok()).collect();
        if date_parts.len() != 3 {
            return Err(GatewayError::Validation(format!("unparseable TRD_DATE: {date_field}")));
        }
        if time_parts.len() != 3 {
            return Err(GatewayError::Validation(format!("unparseable TRDTIM_1: {time_field}")));
        }
        let (year, month, day) = (date_parts[0], date_parts[1] as u32, date_parts[2] as u32);
        let (hour, minute, second) = (time_parts[0], time_parts[1], time_parts[2]);

        let naive_date = NaiveDate::from_ymd_opt(year, month, day)
            .ok_or_else(|| GatewayError::Validation("invalid feed date".into()))?;
        let naive_time = NaiveTime::from_hms_opt(hour, minute, second)
            .ok_or_else(|| GatewayError::Validation("invalid feed time".into()))?;
        let feed_dt = self
            .feedzone
            .from_local_datetime(&naive_date.and_time(naive_time))
            .single()
            .ok_or_else(|| GatewayError::Validation("ambiguous feed timestamp".into()))?;
        let local_dt = feed_dt.with_timezone(&self.localzone);

        if minute as i64 != self.last_minute {
            self.last_minute = minute as i64;
            return Ok(Some(format!("{} {}:00", local_dt.format("%Y-%m-%d"), local_dt.format("%H:%M"))));
        }
        Ok(None)
    }
}

pub struct Engine {
    config: GatewayConfig,
    pool: ChannelPool,
    callbacks: CallbackRegistry,
    orders: OrderBook,
    tickets: TicketBook,
    symbols: SymbolTable,
    accounts: AccountModel,
    positions: PositionBook,
    downstream: DownstreamHub,
    clients: ClientRegistry,
    watchdog: crate::watchdog::Watchdog,
    order_route: OrderRoute,
    primary_exchange: HashMap<String, String>,
    clock: FeedClock,
    wire_tx: Option<mpsc::UnboundedSender<String>>,
    internal_tx: Option<mpsc::UnboundedSender<EngineEvent>>,
    commands_tx: mpsc::UnboundedSender<EngineCommand>,
    commands_rx: Option<mpsc::UnboundedReceiver<EngineCommand>>,
    connected: bool,
    /// Set by [`Self::force_disconnect`]; [`Self::run`] checks it after every
    /// `select!` branch and returns it to end the process for a supervised
    /// restart, the same way a watchdog trip already does.
    fatal: Option<GatewayError>,
}

impl Engine {
    pub fn new(config: GatewayConfig) -> Self {
        let feedzone: Tz = config.api_timezone.parse().unwrap_or(chrono_tz::America::New_York);
        let order_route = OrderRoute::parse(&config.api_route);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let callbacks = CallbackRegistry::new(config.callback_timeouts());
        Self {
            config,
            pool: ChannelPool::new(),
            callbacks,
            orders: OrderBook::new(),
            tickets: TicketBook::new(),
            symbols: SymbolTable::new(),
            accounts: AccountModel::new(),
            positions: PositionBook::new(),
            downstream: DownstreamHub::new(),
            clients: ClientRegistry::new(),
            watchdog: crate::watchdog::Watchdog::new(),
            order_route,
            primary_exchange: HashMap::new(),
            clock: FeedClock::new(feedzone, chrono_tz::UTC),
            wire_tx: None,
            internal_tx: None,
            commands_tx,
            commands_rx: Some(commands_rx),
            connected: false,
            fatal: None,
        }
    }

    pub fn downstream(&self) -> DownstreamHub { self.downstream.clone() }

    /// A cloneable handle downstream-facing listeners use to submit client
    /// requests without holding a reference to the engine itself.
    pub fn command_sender(&self) -> mpsc::UnboundedSender<EngineCommand> { self.commands_tx.clone() }

    fn send_line(&self, line: String) {
        if let Some(tx) = &self.wire_tx {
            let _ = tx.send(line);
        }
    }

    fn open_channel(&mut self, service: &str, topic: &str) -> ChannelId {
        if let Some(existing) = self.pool.checkout(service, topic) {
            return existing.id.clone();
        }
        let (channel, line) = self.pool.open(service, topic);
        let id = channel.id.clone();
        self.send_line(line);
        id
    }

    /// Spawns the wire connection and drives the engine's event loop. Runs
    /// until the process is asked to stop.
    #[instrument(skip(self))]
    pub async fn run(mut self) -> Result<()> {
        let wire = WireClient::new(self.config.api_host.clone(), self.config.api_port);
        self.wire_tx = Some(wire.sender());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        tokio::spawn(wire.run(events_tx));

        let (internal_tx, mut internal_rx) = mpsc::unbounded_channel();
        self.internal_tx = Some(internal_tx);
        let mut commands_rx = self.commands_rx.take().expect("run() called once");

        self.open_channel(LOGIN_SERVICE, LOGIN_TOPIC);

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    match event {
                        Some(WireEvent::Frame(frame)) => self.handle_frame(&frame),
                        Some(WireEvent::Disconnected) => self.handle_disconnect(),
                        Some(WireEvent::Fatal(reason)) => self.force_disconnect(reason),
                        None => return Ok(()),
                    }
                }
                event = internal_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_internal(event);
                    }
                }
                cmd = commands_rx.recv() => {
                    if let Some(cmd) = cmd {
                        self.handle_command(cmd);
                    }
                }
                _ = ticker.tick() => {
                    if self.watchdog.tick(self.connected) {
                        return Err(GatewayError::Fatal(format!(
                            "upstream disconnected for {}s, giving up",
                            self.watchdog.seconds_disconnected()
                        )));
                    }
                    self.callbacks.sweep_expired();
                    if self.connected && self.config.enable_seconds_tick {
                        self.poll_time();
                    }
                }
            }
            if let Some(err) = self.fatal.take() {
                return Err(err);
            }
        }
    }

    /// Publishes the disconnect/error pair to downstream and marks the
    /// engine's next `select!` iteration as fatal. Mirrors `force_disconnect`
    /// in the original client: account-query failure, the standing `ORDERS`
    /// advise being torn down upstream, a `$TIME=Error 17` sentinel, and an
    /// oversized inbound line all route here, alongside the watchdog's own
    /// inline trip.
    fn force_disconnect(&mut self, reason: String) {
        warn!(reason, "forcing disconnect");
        self.connected = false;
        self.downstream.publish(DownstreamEvent::ConnectionStatusChanged("Disconnected".into()));
        self.downstream.publish(DownstreamEvent::Error { id: "0".into(), message: reason.clone() });
        self.fatal = Some(GatewayError::Fatal(reason));
    }

    /// Applies a resolved request/update that arrived through [`EngineEvent`]
    /// rather than directly off the wire.
    fn handle_internal(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Accounts(Ok(rows)) => {
                if rows.is_empty() {
                    self.force_disconnect("initial account query returned no accounts".into());
                } else {
                    self.apply_accounts_response(rows);
                }
            }
            EngineEvent::Accounts(Err(err)) => {
                self.force_disconnect(format!("initial account query failed: {err}"));
            }
            EngineEvent::TimeRows(Ok(rows)) => self.apply_time_response(rows),
            EngineEvent::TimeRows(Err(err)) => warn!(%err, "time poll failed"),
            EngineEvent::SymbolInit(symbol, callback_id, Ok(rows)) => self.apply_symbol_init(&symbol, callback_id, rows),
            EngineEvent::SymbolInit(symbol, callback_id, Err(err)) => {
                warn!(%symbol, %err, "symbol init request failed");
                self.callbacks.resolve(callback_id, Err(GatewayError::Validation(err.to_string())));
            }
            EngineEvent::SymbolRow(symbol, row) => {
                if let Some(fields) = as_field_map(&row) {
                    self.apply_symbol_update(&symbol, &fields);
                }
            }
            EngineEvent::OrderRow(row) => {
                if let Some(fields) = as_field_map(&row) {
                    self.apply_order_update(fields);
                }
            }
            EngineEvent::OrderAdviseTerminated => {
                self.force_disconnect("ORDERS advise has been terminated by the API".into());
            }
            EngineEvent::PositionRow(row) => {
                if let Some(fields) = as_field_map(&row) {
                    self.apply_position_update(&fields);
                }
            }
            EngineEvent::AccountData(account, Ok(rows)) => self.apply_account_data_response(&account, rows),
            EngineEvent::AccountData(account, Err(err)) => warn!(%account, %err, "account data request failed"),
            EngineEvent::CallbackResolved(id, result) => self.callbacks.resolve(id, result),
        }
    }

    /// Applies one downstream client's request. Reply channels are best
    /// effort: a client that disconnected before the reply went out just
    /// drops it.
    fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::OpenClient { reply } => { let _ = reply.send(self.open_client()); }
            EngineCommand::CloseClient(client) => self.close_client(client),
            EngineCommand::SetAccount { account, reply } => { let _ = reply.send(self.set_account(&account)); }
            EngineCommand::EnableSymbol { symbol, client } => { self.enable_symbol(&symbol, client); }
            EngineCommand::DisableSymbol { symbol, client } => { self.disable_symbol(&symbol, client); }
            EngineCommand::SubmitOrder { account, order_type, symbol, quantity, price, stop_price, reply } => {
                let result = self.submit_order(&account, order_type, &symbol, quantity, price, stop_price);
                let _ = reply.send(result);
            }
            EngineCommand::ChangeOrder { account, order_type, symbol, quantity, price, stop_price, refers_to_id, reply } => {
                let result = self.change_order(&account, order_type, &symbol, quantity, price, stop_price, &refers_to_id);
                let _ = reply.send(result);
            }
            EngineCommand::CancelOrder { oid } => self.cancel_order(&oid),
            EngineCommand::GlobalCancel => self.request_global_cancel(),
            EngineCommand::RequestPositions => self.request_positions(),
            EngineCommand::RequestExecutions => self.request_executions(),
            EngineCommand::RequestAccountData { account } => self.request_account_data(&account),
        }
    }

    /// Awaits a one-shot response and forwards it back into the engine's own
    /// event loop. No-op outside of [`Self::run`] (tests call `apply_*`
    /// directly instead). `callback_id`, if given, resolves the matching
    /// [`CallbackRegistry`] entry with the response's outcome before `wrap`
    /// is applied, so a caller's registered callback completes (or expires)
    /// alongside the data it was waiting on.
    fn follow_response(
        &self,
        rx: oneshot::Receiver<Result<Vec<Value>>>,
        callback_id: Option<u64>,
        wrap: impl FnOnce(Result<Vec<Value>>) -> EngineEvent + Send + 'static,
    ) {
        let Some(tx) = self.internal_tx.clone() else { return };
        tokio::spawn(async move {
            if let Ok(result) = rx.await {
                if let Some(id) = callback_id {
                    let resolved = result.as_ref().map(|_| ()).map_err(|err| GatewayError::Validation(err.to_string()));
                    let _ = tx.send(EngineEvent::CallbackResolved(id, resolved));
                }
                let _ = tx.send(wrap(result));
            }
        });
    }

    /// Like [`Self::follow_response`], but fans a successful response's rows
    /// out one `wrap(row)` event at a time instead of delivering the whole
    /// batch at once. Used for responses that carry a whole book snapshot
    /// (e.g. the initial `adviserequest` reply on the order topic).
    fn follow_rows(&self, rx: oneshot::Receiver<Result<Vec<Value>>>, callback_id: Option<u64>, wrap: impl Fn(Value) -> EngineEvent + Send + 'static) {
        let Some(tx) = self.internal_tx.clone() else { return };
        tokio::spawn(async move {
            match rx.await {
                Ok(Ok(rows)) => {
                    if let Some(id) = callback_id {
                        let _ = tx.send(EngineEvent::CallbackResolved(id, Ok(())));
                    }
                    for row in rows {
                        if tx.send(wrap(row)).is_err() {
                            break;
                        }
                    }
                }
                Ok(Err(err)) => {
                    if let Some(id) = callback_id {
                        let _ = tx.send(EngineEvent::CallbackResolved(id, Err(GatewayError::Validation(err.to_string()))));
                    }
                }
                Err(_) => {}
            }
        });
    }

    /// Drains a streaming update handle for the lifetime of the subscription,
    /// forwarding each row. Stops once the channel is torn down; `on_terminate`,
    /// if given, is sent once when that happens so the caller can react to an
    /// upstream-initiated teardown rather than one it requested itself.
    fn follow_updates(
        &self,
        mut rx: mpsc::UnboundedReceiver<Option<Value>>,
        wrap: impl Fn(Value) -> EngineEvent + Send + 'static,
        on_terminate: Option<EngineEvent>,
    ) {
        let Some(tx) = self.internal_tx.clone() else { return };
        tokio::spawn(async move {
            while let Some(row) = rx.recv().await {
                match row {
                    Some(row) => {
                        if tx.send(wrap(row)).is_err() {
                            break;
                        }
                    }
                    None => {
                        if let Some(event) = on_terminate {
                            let _ = tx.send(event);
                        }
                        break;
                    }
                }
            }
        });
    }

    fn handle_frame(&mut self, frame: &crate::frame::InboundFrame) {
        match route_frame(&mut self.pool, frame) {
            RoutedEvent::System(sys) => self.handle_system(sys),
            RoutedEvent::ChannelReplay(line) => self.send_line(line),
            RoutedEvent::ProtocolError(id, err) => {
                warn!(line = %err.downstream_line(&id), "protocol mismatch");
                self.downstream.publish(DownstreamEvent::Error { id: id.clone(), message: err.to_string() });
            }
            RoutedEvent::Unrouted => {}
        }
        if let Some(id) = &frame.id {
            self.pool.release(id);
        }
    }

    fn handle_system(&mut self, sys: crate::frame::SystemData) {
        info!(msg = %sys.msg, item = ?sys.item, "system message");
        if sys.msg == "startup" {
            self.connected = true;
            self.downstream.publish(DownstreamEvent::ConnectionStatusChanged("Connecting".into()));
            let (callback_id, _rx) = self.callbacks.register(CallbackLabel::Account);
            let rx = self.request_accounts();
            self.follow_response(rx, Some(callback_id), EngineEvent::Accounts);
            self.subscribe_order_updates();
        }
    }

    /// Opens a standing subscription on the order topic so every status
    /// change streams in without a per-order poll.
    fn subscribe_order_updates(&mut self) {
        let id = self.open_channel(ACCOUNT_SERVICE, ORDER_TOPIC);
        let Some(channel) = self.pool.get_mut(&id) else { return };
        let (resp_rx, upd_rx, line) = channel.adviserequest(ORDERS_TABLE, "*", "");
        if let Some(line) = line {
            self.send_line(line);
        }
        let (callback_id, _rx) = self.callbacks.register(CallbackLabel::OrderStatus);
        self.follow_rows(resp_rx, Some(callback_id), EngineEvent::OrderRow);
        self.follow_updates(upd_rx, EngineEvent::OrderRow, Some(EngineEvent::OrderAdviseTerminated));
    }

    fn handle_disconnect(&mut self) {
        self.connected = false;
        self.downstream.publish(DownstreamEvent::ConnectionStatusChanged("Disconnected".into()));
        self.downstream.publish(DownstreamEvent::Error { id: "0".into(), message: "API Disconnected".into() });
    }

    fn poll_time(&mut self) {
        let id = self.open_channel(LIVEQUOTE_SERVICE, LIVEQUOTE_TOPIC);
        if let Some(channel) = self.pool.get_mut(&id) {
            let (rx, line) = channel.request(LIVEQUOTE_TOPIC, "DISP_NAME,TRDTIM_1,TRD_DATE", "DISP_NAME='$TIME'");
            if let Some(line) = line {
                self.send_line(line);
            }
            let (callback_id, _rx) = self.callbacks.register(CallbackLabel::Timer);
            self.follow_response(rx, Some(callback_id), EngineEvent::TimeRows);
        }
    }

    /// Handles the row from a `$TIME` poll once its response resolves.
    /// Exposed so the caller driving the oneshot result can feed it back in.
    pub fn apply_time_response(&mut self, rows: Vec<Value>) {
        let Some(row) = rows.into_iter().next() else { return };
        let Some(map) = row.as_object() else { return };
        let fields: FieldMap = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        match self.clock.on_time_row(&fields) {
            Ok(Some(line)) => self.downstream.publish(DownstreamEvent::Time(line)),
            Ok(None) => {}
            Err(GatewayError::Fatal(reason)) => self.force_disconnect(reason),
            Err(err) => warn!(%err, "time poll error"),
        }
    }

    // -- public trading API --------------------------------------------

    pub fn open_client(&mut self) -> (ClientId, tokio::sync::broadcast::Receiver<DownstreamEvent>) {
        let id = self.clients.open_client();
        (id, self.downstream.subscribe())
    }

    pub fn close_client(&mut self, client: ClientId) {
        self.clients.close_client(client);
        self.symbols.drop_client(client);
    }

    pub fn request_accounts(&mut self) -> oneshot::Receiver<Result<Vec<Value>>> {
        let id = self.open_channel(ACCOUNT_SERVICE, ORDER_TOPIC);
        let channel = self.pool.get_mut(&id).expect("just opened");
        let (rx, line) = channel.request(ACCOUNT_TABLE, "*", "");
        if let Some(line) = line {
            self.send_line(line);
        }
        rx
    }

    /// Applies the response from [`Self::request_accounts`].
    pub fn apply_accounts_response(&mut self, rows: Vec<Value>) {
        let fields: Vec<FieldMap> = rows
            .into_iter()
            .filter_map(|v| v.as_object().map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect()))
            .collect();
        self.accounts.set_accounts(&fields);
        self.downstream.publish(DownstreamEvent::Accounts(self.accounts.accounts().to_vec()));
        self.downstream.publish(DownstreamEvent::ConnectionStatusChanged("Up".into()));
    }

    pub fn set_account(&mut self, account: &str) -> Result<bool> {
        let applied = self.accounts.set_account(account)?;
        if applied {
            self.downstream.publish(DownstreamEvent::CurrentAccount(account.to_string()));
        }
        Ok(applied)
    }

    pub fn current_account(&self) -> Option<&str> { self.accounts.current() }

    /// Subscribes `client` to `symbol`. A brand-new symbol first gets a
    /// one-shot `LIVEQUOTE` request for its init snapshot; the standing
    /// `advise` only starts once that snapshot clears the `SYMBOL_ERROR`
    /// gate, mirroring `API_Symbol.__init__`/`symbol_init`.
    pub fn enable_symbol(&mut self, symbol: &str, client: ClientId) -> Subscribe {
        let result = self.symbols.subscribe(symbol, client);
        if matches!(result, Subscribe::NeedsInit) {
            self.request_symbol_init(symbol);
        }
        result
    }

    fn request_symbol_init(&mut self, symbol: &str) {
        let id = self.open_channel(LIVEQUOTE_SERVICE, LIVEQUOTE_TOPIC);
        let Some(channel) = self.pool.get_mut(&id) else { return };
        let (rx, line) = channel.request(LIVEQUOTE_TOPIC, "*", &format!("DISP_NAME='{symbol}'"));
        if let Some(line) = line {
            self.send_line(line);
        }
        let (callback_id, _rx) = self.callbacks.register(CallbackLabel::AddSymbol);
        let owned_symbol = symbol.to_string();
        self.follow_response(rx, None, move |result| EngineEvent::SymbolInit(owned_symbol.clone(), callback_id, result));
    }

    /// Applies the response from [`Self::request_symbol_init`]. A
    /// `SYMBOL_ERROR` field in the snapshot row means the upstream doesn't
    /// recognize the symbol: the add-symbol callback fails and the symbol is
    /// dropped rather than advised. Otherwise the snapshot applies like any
    /// other update and the standing advise starts.
    fn apply_symbol_init(&mut self, symbol: &str, callback_id: u64, rows: Vec<Value>) {
        let Some(fields) = rows.into_iter().next().and_then(|row| as_field_map(&row)) else {
            self.callbacks.resolve(callback_id, Err(GatewayError::Validation("symbol init returned no row".into())));
            return;
        };
        if fields.contains_key("SYMBOL_ERROR") {
            warn!(symbol, "SYMBOL_ERROR on init, disabling symbol");
            let clients: Vec<ClientId> = self.symbols.get(symbol).map(|s| s.clients.iter().copied().collect()).unwrap_or_default();
            for client in clients {
                self.symbols.unsubscribe(symbol, client);
            }
            self.callbacks.resolve(callback_id, Err(GatewayError::Validation(format!("{symbol}: SYMBOL_ERROR"))));
            return;
        }
        self.apply_symbol_update(symbol, &fields);
        if let Some(entry) = self.symbols.get_mut(symbol) {
            entry.initialized = true;
        }
        self.callbacks.resolve(callback_id, Ok(()));
        self.start_symbol_advise(symbol);
    }

    fn start_symbol_advise(&mut self, symbol: &str) {
        let id = self.open_channel(LIVEQUOTE_SERVICE, LIVEQUOTE_TOPIC);
        let Some(channel) = self.pool.get_mut(&id) else { return };
        let (rx, line) = channel.advise(LIVEQUOTE_TOPIC, "*", &format!("DISP_NAME='{symbol}'"));
        if let Some(line) = line {
            self.send_line(line);
        }
        let owned_symbol = symbol.to_string();
        self.follow_updates(rx, move |row| EngineEvent::SymbolRow(owned_symbol.clone(), row), None);
    }

    pub fn disable_symbol(&mut self, symbol: &str, client: ClientId) -> Unsubscribe {
        let result = self.symbols.unsubscribe(symbol, client);
        if matches!(result, Unsubscribe::ShouldRemove) {
            let id = self.open_channel(LIVEQUOTE_SERVICE, LIVEQUOTE_TOPIC);
            if let Some(channel) = self.pool.get_mut(&id) {
                let (_rx, line) = channel.unadvise(LIVEQUOTE_TOPIC, "*", &format!("DISP_NAME='{symbol}'"));
                if let Some(line) = line {
                    self.send_line(line);
                }
            }
        }
        result
    }

    pub fn set_primary_exchange(&mut self, symbol: &str, exchange: Option<&str>) {
        match exchange {
            Some(exchange) => { self.primary_exchange.insert(symbol.to_string(), exchange.to_string()); }
            None => { self.primary_exchange.remove(symbol); }
        }
    }

    pub fn set_order_route(&mut self, spec: &str) { self.order_route = OrderRoute::parse(spec); }

    pub fn order_route(&self) -> &OrderRoute { &self.order_route }

    #[instrument(skip(self))]
    pub fn submit_order(
        &mut self,
        account: &str,
        order_type: OrderType,
        symbol: &str,
        quantity: i64,
        price: Option<f64>,
        stop_price: Option<f64>,
    ) -> Result<String> {
        if !self.accounts.contains(account) {
            return Err(GatewayError::Validation("account unknown".into()));
        }
        let client_order_id = uuid::Uuid::new_v4().to_string();
        let req = OrderTicketRequest {
            account,
            route: &self.order_route,
            order_type,
            price,
            stop_price,
            symbol,
            quantity,
            client_order_id: &client_order_id,
            staged_tag: None,
            refers_to_id: None,
            primary_exchange: self.primary_exchange.get(symbol).map(String::as_str),
        };
        let fields = build_order_fields(account, &req)?;
        let data = encode_poke_data(&fields);

        let (callback_id, _rx) = self.callbacks.register(CallbackLabel::Order);
        self.orders.track_pending(client_order_id.clone(), Some(callback_id));
        let id = self.open_channel(ACCOUNT_SERVICE, ORDER_TOPIC);
        let channel = self.pool.get_mut(&id).expect("just opened");
        let (_rx, line) = channel.poke("ORDERS", "*", "", &data);
        if let Some(line) = line {
            self.send_line(line);
        }
        Ok(client_order_id)
    }

    pub fn create_staged_order_ticket(
        &mut self,
        account: &str,
        order_type: OrderType,
        symbol: &str,
        quantity: i64,
        price: Option<f64>,
        stop_price: Option<f64>,
    ) -> Result<String> {
        let tag = new_ticket_id();
        let req = OrderTicketRequest {
            account,
            route: &self.order_route,
            order_type,
            price,
            stop_price,
            symbol,
            quantity,
            client_order_id: &tag,
            staged_tag: Some(&tag),
            refers_to_id: None,
            primary_exchange: self.primary_exchange.get(symbol).map(String::as_str),
        };
        let fields = build_order_fields(account, &req)?;
        let data = encode_poke_data(&fields);

        self.tickets.track_pending(tag.clone());
        let id = self.open_channel(ACCOUNT_SERVICE, ORDER_TOPIC);
        let channel = self.pool.get_mut(&id).expect("just opened");
        let (_rx, line) = channel.poke("ORDERS", "*", "", &data);
        if let Some(line) = line {
            self.send_line(line);
        }
        Ok(tag)
    }

    /// Resubmits an existing order's parameters under `REFERS_TO_ID`,
    /// producing `TYPE=UserSubmitChange` instead of a fresh submission.
    #[instrument(skip(self))]
    pub fn change_order(
        &mut self,
        account: &str,
        order_type: OrderType,
        symbol: &str,
        quantity: i64,
        price: Option<f64>,
        stop_price: Option<f64>,
        refers_to_id: &str,
    ) -> Result<()> {
        if !self.accounts.contains(account) {
            return Err(GatewayError::Validation("account unknown".into()));
        }
        let req = OrderTicketRequest {
            account,
            route: &self.order_route,
            order_type,
            price,
            stop_price,
            symbol,
            quantity,
            client_order_id: refers_to_id,
            staged_tag: None,
            refers_to_id: Some(refers_to_id),
            primary_exchange: self.primary_exchange.get(symbol).map(String::as_str),
        };
        let fields = build_order_fields(account, &req)?;
        let data = encode_poke_data(&fields);

        let id = self.open_channel(ACCOUNT_SERVICE, ORDER_TOPIC);
        let channel = self.pool.get_mut(&id).expect("just opened");
        let (_rx, line) = channel.poke("ORDERS", "*", "", &data);
        if let Some(line) = line {
            self.send_line(line);
        }
        Ok(())
    }

    pub fn cancel_order(&mut self, oid: &str) {
        let id = self.open_channel(ACCOUNT_SERVICE, ORDER_TOPIC);
        let channel = self.pool.get_mut(&id).expect("just opened");
        let data = encode_poke_data(&[("TYPE".to_string(), "UserSubmitCancel".to_string()), ("REFERS_TO_ID".to_string(), oid.to_string())]);
        let (_rx, line) = channel.poke("ORDERS", "*", "", &data);
        if let Some(line) = line {
            self.send_line(line);
        }
    }

    /// Cancels every live or pending order in one sweep.
    pub fn request_global_cancel(&mut self) {
        for oid in self.orders.cancellable() {
            self.cancel_order(&oid);
        }
    }

    pub fn apply_order_update(&mut self, data: FieldMap) -> Option<(String, String, String)> {
        let applied = self.orders.apply(data)?;
        if let Some(callback_id) = applied.fired_callback {
            self.callbacks.resolve(callback_id, Ok(()));
        }
        let rendered = applied.fields;
        let permid = rendered.get("permid")?.as_str()?.to_string();
        let status = rendered.get("status")?.as_str()?.to_string();
        let otype = rendered.get("TYPE").and_then(Value::as_str).unwrap_or_default().to_string();
        let account = rendered.get("account").and_then(Value::as_str).unwrap_or_default().to_string();
        let line = format!("{account} {otype} {status}");
        self.downstream.publish(DownstreamEvent::OrderStatus { permid: permid.clone(), line: line.clone() });
        Some((permid, account, status))
    }

    pub fn apply_symbol_update(&mut self, symbol: &str, data: &FieldMap) {
        let Some(entry) = self.symbols.get_mut(symbol) else { return };
        let update = entry.apply_update(data, self.config.enable_ticker, self.config.enable_high_low);
        if let Some(line) = update.quote_line {
            self.downstream.publish(DownstreamEvent::Quote { symbol: symbol.to_string(), line: line.trim_start_matches(&format!("quote.{symbol}:")).to_string() });
        }
        if let Some(line) = update.trade_line {
            self.downstream.publish(DownstreamEvent::Trade { symbol: symbol.to_string(), line: line.trim_start_matches(&format!("trade.{symbol}:")).to_string() });
        }
    }

    /// Requests the whole position book, unfiltered by account the same way
    /// `request_positions` does upstream; rows apply through
    /// [`Self::apply_position_update`] as they arrive and settle into
    /// whichever (account, symbol) pair they name.
    pub fn request_positions(&mut self) {
        let id = self.open_channel(ACCOUNT_SERVICE, ORDER_TOPIC);
        if let Some(channel) = self.pool.get_mut(&id) {
            let (rx, line) = channel.request(POSITION_TABLE, "*", "");
            if let Some(line) = line {
                self.send_line(line);
            }
            let (callback_id, _rx) = self.callbacks.register(CallbackLabel::Position);
            self.follow_rows(rx, Some(callback_id), EngineEvent::PositionRow);
        }
    }

    pub fn apply_position_update(&mut self, data: &FieldMap) {
        let Some(position) = self.positions.apply(data) else { return };
        self.downstream.publish(DownstreamEvent::Position {
            account: position.account.clone(),
            symbol: position.symbol.clone(),
            quantity: position.quantity,
        });
    }

    pub fn position(&self, account: &str, symbol: &str) -> Option<&crate::position::Position> {
        self.positions.get(account, symbol)
    }

    /// Re-requests the full order table; rows apply through the same path as
    /// the standing subscription, so fills show up as ordinary order-status
    /// broadcasts rather than a dedicated response.
    pub fn request_executions(&mut self) {
        let id = self.open_channel(ACCOUNT_SERVICE, ORDER_TOPIC);
        if let Some(channel) = self.pool.get_mut(&id) {
            let (rx, line) = channel.request(ORDERS_TABLE, "*", "");
            if let Some(line) = line {
                self.send_line(line);
            }
            self.follow_rows(rx, None, EngineEvent::OrderRow);
        }
    }

    /// Orders that have fully filled, mirroring `format_executions`.
    pub fn executions(&self) -> Vec<FieldMap> {
        self.orders.executions().into_iter().map(|o| o.fields.clone()).collect()
    }

    /// Requests the `DEPOSIT` row for one account; `BANK.BRANCH.CUSTOMER.DEPOSIT`
    /// is split back out into the where-clause the upstream expects.
    pub fn request_account_data(&mut self, account: &str) {
        let id = self.open_channel(ACCOUNT_SERVICE, ORDER_TOPIC);
        if let Some(channel) = self.pool.get_mut(&id) {
            let parts: Vec<&str> = account.splitn(4, '.').collect();
            let where_clause = match parts.as_slice() {
                [bank, branch, customer, deposit] => {
                    format!("BANK='{bank}',BRANCH='{branch}',CUSTOMER='{customer}',DEPOSIT='{deposit}'")
                }
                _ => String::new(),
            };
            let (rx, line) = channel.request(ACCOUNT_DATA_TABLE, "*", &where_clause);
            if let Some(line) = line {
                self.send_line(line);
            }
            let account = account.to_string();
            self.follow_response(rx, None, move |result| EngineEvent::AccountData(account, result));
        }
    }

    /// Applies the response from [`Self::request_account_data`], caching the
    /// derived `_cash` snapshot and broadcasting it downstream.
    pub fn apply_account_data_response(&mut self, account: &str, rows: Vec<Value>) {
        let Some(row) = rows.into_iter().next() else { return };
        self.accounts.cache_account_data(account, row);
        if let Some(data) = self.accounts.account_data(account) {
            let json = serde_json::to_string(data).unwrap_or_default();
            self.downstream.publish(DownstreamEvent::AccountData { account: account.to_string(), json });
        }
    }

    pub fn callback_pending_count(&self) -> usize { self.callbacks.pending_count() }

    pub fn channel_count(&self) -> usize { self.pool.len() }
}

/// Converts a decoded JSON row into a [`FieldMap`], as every inbound
/// response/update row ultimately is: a flat string-keyed object.
fn as_field_map(value: &Value) -> Option<FieldMap> {
    value.as_object().map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_row_emits_once_per_minute() {
        let mut clock = FeedClock::new(chrono_tz::America::New_York, chrono_tz::UTC);
        let row = FieldMap::from([
            ("TRDTIM_1".into(), Value::String("09:30:00".into())),
            ("TRD_DATE".into(), Value::String("2026-08-01".into())),
        ]);
        let first = clock.on_time_row(&row).unwrap();
        assert!(first.is_some());
        let second = clock.on_time_row(&row).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn time_row_error17_is_fatal() {
        let mut clock = FeedClock::new(chrono_tz::America::New_York, chrono_tz::UTC);
        let row = FieldMap::from([
            ("TRDTIM_1".into(), Value::String("Error 17".into())),
            ("TRD_DATE".into(), Value::String("2026-08-01".into())),
        ]);
        assert!(matches!(clock.on_time_row(&row), Err(GatewayError::Fatal(_))));
    }

    #[test]
    fn time_row_lowercase_error17_is_fatal() {
        let mut clock = FeedClock::new(chrono_tz::America::New_York, chrono_tz::UTC);
        let row = FieldMap::from([
            ("TRDTIM_1".into(), Value::String("error 17".into())),
            ("TRD_DATE".into(), Value::String("2026-08-01".into())),
        ]);
        assert!(matches!(clock.on_time_row(&row), Err(GatewayError::Fatal(_))));
    }

    #[test]
    fn time_row_other_sentinel_is_non_fatal_validation_error() {
        let mut clock = FeedClock::new(chrono_tz::America::New_York, chrono_tz::UTC);
        let row = FieldMap::from([
            ("TRDTIM_1".into(), Value::String("Error 2".into())),
            ("TRD_DATE".into(), Value::String("2026-08-01".into())),
        ]);
        assert!(matches!(clock.on_time_row(&row), Err(GatewayError::Validation(_))));
    }

    #[test]
    fn engine_tracks_new_symbol_subscription() {
        let mut engine = Engine::new(GatewayConfig::default());
        let (_id, _rx) = engine.open_client();
        assert!(matches!(engine.enable_symbol("AAPL", 1), Subscribe::NeedsInit));
        assert!(matches!(engine.enable_symbol("AAPL", 1), Subscribe::AlreadyWatched));
    }

    #[test]
    fn symbol_init_without_symbol_error_starts_advise_and_marks_initialized() {
        let mut engine = Engine::new(GatewayConfig::default());
        let (_id, _rx) = engine.open_client();
        engine.enable_symbol("AAPL", 1);
        let (callback_id, mut callback_rx) = engine.callbacks.register(CallbackLabel::AddSymbol);
        engine.apply_symbol_init("AAPL", callback_id, vec![serde_json::json!({"COMPANY_NAME": "Apple Inc"})]);
        assert!(engine.symbols.get("AAPL").unwrap().initialized);
        assert_eq!(callback_rx.try_recv().unwrap().unwrap(), ());
    }

    #[test]
    fn symbol_init_with_symbol_error_disables_symbol_and_fails_callback() {
        let mut engine = Engine::new(GatewayConfig::default());
        let (_id, _rx) = engine.open_client();
        engine.enable_symbol("BOGUS", 1);
        let (callback_id, mut callback_rx) = engine.callbacks.register(CallbackLabel::AddSymbol);
        engine.apply_symbol_init("BOGUS", callback_id, vec![serde_json::json!({"SYMBOL_ERROR": "unknown symbol"})]);
        assert!(engine.symbols.get("BOGUS").is_none());
        assert!(callback_rx.try_recv().unwrap().is_err());
    }

    #[test]
    fn submit_order_callback_resolves_on_first_promotion() {
        let mut engine = Engine::new(GatewayConfig::default());
        engine.apply_accounts_response(vec![serde_json::json!({
            "BANK": "B", "BRANCH": "BR", "CUSTOMER": "C", "DEPOSIT": "D1"
        })]);
        let client_order_id = engine
            .submit_order("B.BR.C.D1", OrderType::Limit, "AAPL", 100, Some(12.34), None)
            .unwrap();
        assert_eq!(engine.callback_pending_count(), 1);

        let data = FieldMap::from([
            ("ORDER_ID".into(), Value::String("S1".into())),
            ("ORIGINAL_ORDER_ID".into(), Value::String("O1".into())),
            ("CLIENT_ORDER_ID".into(), Value::String(client_order_id)),
            ("CURRENT_STATUS".into(), Value::String("PENDING".into())),
            ("TYPE".into(), Value::String("UserSubmitOrder".into())),
            ("BANK".into(), Value::String("B".into())),
            ("BRANCH".into(), Value::String("BR".into())),
            ("CUSTOMER".into(), Value::String("C".into())),
            ("DEPOSIT".into(), Value::String("D1".into())),
        ]);
        let (permid, account, status) = engine.apply_order_update(data).unwrap();
        assert_eq!(permid, "O1");
        assert_eq!(account, "B.BR.C.D1");
        assert_eq!(status, "Submitted");
        assert_eq!(engine.callback_pending_count(), 0);
    }

    #[tokio::test]
    async fn position_update_publishes_net_quantity() {
        let mut engine = Engine::new(GatewayConfig::default());
        let (_id, mut downstream) = engine.open_client();
        let row = FieldMap::from([
            ("ACCOUNT".into(), Value::String("B.BR.C.D1".into())),
            ("DISP_NAME".into(), Value::String("AAPL".into())),
            ("LONGPOS".into(), Value::String("100".into())),
            ("SHORTPOS".into(), Value::String("40".into())),
        ]);
        engine.apply_position_update(&row);
        assert_eq!(engine.position("B.BR.C.D1", "AAPL").unwrap().quantity, 60.0);
        match downstream.recv().await.unwrap() {
            DownstreamEvent::Position { account, symbol, quantity } => {
                assert_eq!(account, "B.BR.C.D1");
                assert_eq!(symbol, "AAPL");
                assert_eq!(quantity, 60.0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn account_data_response_caches_and_publishes_cash() {
        let mut engine = Engine::new(GatewayConfig::default());
        let (_id, mut downstream) = engine.open_client();
        engine.apply_account_data_response("b.br.c.d1", vec![serde_json::json!({"EXCESS_EQ": "500.004"})]);
        match downstream.recv().await.unwrap() {
            DownstreamEvent::AccountData { account, json } => {
                assert_eq!(account, "b.br.c.d1");
                assert!(json.contains("\"_cash\":500.0"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn executions_only_include_filled_orders() {
        let mut engine = Engine::new(GatewayConfig::default());
        let pending = FieldMap::from([
            ("ORDER_ID".into(), Value::String("O1".into())),
            ("ORIGINAL_ORDER_ID".into(), Value::String("O1".into())),
            ("CURRENT_STATUS".into(), Value::String("PENDING".into())),
            ("TYPE".into(), Value::String("UserSubmitOrder".into())),
        ]);
        engine.apply_order_update(pending);
        assert!(engine.executions().is_empty());

        let filled = FieldMap::from([
            ("ORDER_ID".into(), Value::String("O2".into())),
            ("ORIGINAL_ORDER_ID".into(), Value::String("O2".into())),
            ("CURRENT_STATUS".into(), Value::String("COMPLETED".into())),
            ("TYPE".into(), Value::String("ExchangeTradeOrder".into())),
            ("ORIGINAL_VOLUME".into(), Value::String("100".into())),
            ("VOLUME_TRADED".into(), Value::String("100".into())),
        ]);
        engine.apply_order_update(filled);
        assert_eq!(engine.executions().len(), 1);
    }

    #[test]
    fn change_order_rejects_unknown_account() {
        let mut engine = Engine::new(GatewayConfig::default());
        let err = engine.change_order("nobody.here.at.all", OrderType::Limit, "AAPL", 100, Some(12.5), None, "O1").unwrap_err();
        assert!(err.to_string().contains("account unknown"));
    }

    #[test]
    fn change_order_accepts_known_account() {
        let mut engine = Engine::new(GatewayConfig::default());
        engine.apply_accounts_response(vec![serde_json::json!({
            "BANK": "B", "BRANCH": "BR", "CUSTOMER": "C", "DEPOSIT": "D1"
        })]);
        assert!(engine.change_order("B.BR.C.D1", OrderType::Limit, "AAPL", 100, Some(12.5), None, "O1").is_ok());
    }
}
