//! Downstream client listener.
//!
//! Trading clients speak a line-oriented command protocol over plain TCP:
//! one command per line in, one [`DownstreamEvent`](crate::downstream::DownstreamEvent)
//! line out. Each accepted connection runs as its own task and only ever
//! touches the engine through an [`EngineCommand`] sender — the same
//! arm's-length pattern `wire.rs` uses for the upstream socket, just facing
//! the other direction.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, instrument, warn};

use crate::downstream::DownstreamEvent;
use crate::engine::EngineCommand;
use crate::order::OrderType;
use crate::{ClientId, Result};

/// Accepts connections until the process stops; each is handed to its own
/// task so one slow client never blocks another.
#[instrument(skip(commands))]
pub async fn serve(host: &str, port: u16, commands: mpsc::UnboundedSender<EngineCommand>) -> Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    info!(host, port, "downstream listener ready");
    accept_loop(listener, commands).await
}

async fn accept_loop(listener: TcpListener, commands: mpsc::UnboundedSender<EngineCommand>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let commands = commands.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, commands).await {
                warn!(%peer, %err, "downstream client session ended with error");
            }
        });
    }
}

async fn handle_client(stream: TcpStream, commands: mpsc::UnboundedSender<EngineCommand>) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    let (reply_tx, reply_rx) = oneshot::channel();
    if commands.send(EngineCommand::OpenClient { reply: reply_tx }).is_err() {
        return Ok(());
    }
    let Ok((client_id, mut downstream)) = reply_rx.await else { return Ok(()) };

    let mut line = String::new();
    loop {
        tokio::select! {
            n = reader.read_line(&mut line) => {
                let n = n?;
                if n == 0 {
                    break;
                }
                let command = line.trim_end().to_string();
                line.clear();
                if !command.is_empty() {
                    dispatch_command(&command, client_id, &commands, &mut writer).await?;
                }
            }
            event = downstream.recv() => {
                match event {
                    Ok(event) => {
                        writer.write_all(event.to_line().as_bytes()).await?;
                        writer.write_u8(b'\n').await?;
                        writer.flush().await?;
                    }
                    Err(_) => break,
                }
            }
        }
    }

    let _ = commands.send(EngineCommand::CloseClient(client_id));
    Ok(())
}

/// Parses and applies one command line. Unrecognized or malformed commands
/// get an `error:` line back rather than dropping the connection.
async fn dispatch_command(
    command: &str,
    client: ClientId,
    commands: &mpsc::UnboundedSender<EngineCommand>,
    writer: &mut BufWriter<tokio::net::tcp::OwnedWriteHalf>,
) -> Result<()> {
    let mut parts = command.split_whitespace();
    let verb = parts.next().unwrap_or_default();
    match verb {
        "account" => {
            let Some(account) = parts.next() else { return write_error(writer, "account requires a name").await };
            let (reply_tx, reply_rx) = oneshot::channel();
            let _ = commands.send(EngineCommand::SetAccount { account: account.to_string(), reply: reply_tx });
            match reply_rx.await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(err)) => write_error(writer, &err.to_string()).await,
                Err(_) => Ok(()),
            }
        }
        "watch" => {
            let Some(symbol) = parts.next() else { return write_error(writer, "watch requires a symbol").await };
            let _ = commands.send(EngineCommand::EnableSymbol { symbol: symbol.to_string(), client });
            Ok(())
        }
        "unwatch" => {
            let Some(symbol) = parts.next() else { return write_error(writer, "unwatch requires a symbol").await };
            let _ = commands.send(EngineCommand::DisableSymbol { symbol: symbol.to_string(), client });
            Ok(())
        }
        "order" => dispatch_order(parts, commands, writer).await,
        "change" => dispatch_change(parts, commands, writer).await,
        "cancel" => {
            let Some(oid) = parts.next() else { return write_error(writer, "cancel requires an order id").await };
            let _ = commands.send(EngineCommand::CancelOrder { oid: oid.to_string() });
            Ok(())
        }
        "cancel-all" => {
            let _ = commands.send(EngineCommand::GlobalCancel);
            Ok(())
        }
        "positions" => {
            let _ = commands.send(EngineCommand::RequestPositions);
            Ok(())
        }
        "executions" => {
            let _ = commands.send(EngineCommand::RequestExecutions);
            Ok(())
        }
        "account-data" => {
            let Some(account) = parts.next() else { return write_error(writer, "account-data requires an account").await };
            let _ = commands.send(EngineCommand::RequestAccountData { account: account.to_string() });
            Ok(())
        }
        other => write_error(writer, &format!("unknown command: {other}")).await,
    }
}

/// `order <account> <buy|sell-as-market|limit|stop|stoplimit> <symbol> <qty> [price] [stop_price]`
async fn dispatch_order(
    mut parts: std::str::SplitWhitespace<'_>,
    commands: &mpsc::UnboundedSender<EngineCommand>,
    writer: &mut BufWriter<tokio::net::tcp::OwnedWriteHalf>,
) -> Result<()> {
    let (Some(account), Some(kind), Some(symbol), Some(quantity)) = (parts.next(), parts.next(), parts.next(), parts.next()) else {
        return write_error(writer, "order requires account, type, symbol, quantity").await;
    };
    let Ok(quantity) = quantity.parse::<i64>() else { return write_error(writer, "quantity must be an integer").await };
    let order_type = match kind {
        "market" => OrderType::Market,
        "limit" => OrderType::Limit,
        "stop" => OrderType::Stop,
        "stoplimit" => OrderType::StopLimit,
        other => return write_error(writer, &format!("unknown order type: {other}")).await,
    };
    let price = parts.next().and_then(|p| p.parse::<f64>().ok());
    let stop_price = parts.next().and_then(|p| p.parse::<f64>().ok());

    let (reply_tx, reply_rx) = oneshot::channel();
    let _ = commands.send(EngineCommand::SubmitOrder {
        account: account.to_string(),
        order_type,
        symbol: symbol.to_string(),
        quantity,
        price,
        stop_price,
        reply: reply_tx,
    });
    match reply_rx.await {
        Ok(Ok(client_order_id)) => {
            writer.write_all(format!("ack: {client_order_id}\n").as_bytes()).await?;
            writer.flush().await?;
            Ok(())
        }
        Ok(Err(err)) => write_error(writer, &err.to_string()).await,
        Err(_) => Ok(()),
    }
}

/// `change <account> <limit|stop|stoplimit|market> <symbol> <qty> <refers_to_id> [price] [stop_price]`
async fn dispatch_change(
    mut parts: std::str::SplitWhitespace<'_>,
    commands: &mpsc::UnboundedSender<EngineCommand>,
    writer: &mut BufWriter<tokio::net::tcp::OwnedWriteHalf>,
) -> Result<()> {
    let (Some(account), Some(kind), Some(symbol), Some(quantity), Some(refers_to_id)) =
        (parts.next(), parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return write_error(writer, "change requires account, type, symbol, quantity, order id").await;
    };
    let Ok(quantity) = quantity.parse::<i64>() else { return write_error(writer, "quantity must be an integer").await };
    let order_type = match kind {
        "market" => OrderType::Market,
        "limit" => OrderType::Limit,
        "stop" => OrderType::Stop,
        "stoplimit" => OrderType::StopLimit,
        other => return write_error(writer, &format!("unknown order type: {other}")).await,
    };
    let price = parts.next().and_then(|p| p.parse::<f64>().ok());
    let stop_price = parts.next().and_then(|p| p.parse::<f64>().ok());

    let (reply_tx, reply_rx) = oneshot::channel();
    let _ = commands.send(EngineCommand::ChangeOrder {
        account: account.to_string(),
        order_type,
        symbol: symbol.to_string(),
        quantity,
        price,
        stop_price,
        refers_to_id: refers_to_id.to_string(),
        reply: reply_tx,
    });
    match reply_rx.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => write_error(writer, &err.to_string()).await,
        Err(_) => Ok(()),
    }
}

async fn write_error(writer: &mut BufWriter<tokio::net::tcp::OwnedWriteHalf>, message: &str) -> Result<()> {
    let event = DownstreamEvent::Error { id: "0".into(), message: message.to_string() };
    writer.write_all(event.to_line().as_bytes()).await?;
    writer.write_u8(b'\n').await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn order_command_round_trips_through_commands_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (commands_tx, mut commands_rx) = mpsc::unbounded_channel::<EngineCommand>();
        tokio::spawn(accept_loop(listener, commands_tx));

        tokio::spawn(async move {
            let (downstream_tx, _keep_alive) = tokio::sync::broadcast::channel(16);
            while let Some(cmd) = commands_rx.recv().await {
                match cmd {
                    EngineCommand::OpenClient { reply } => {
                        let _ = reply.send((1, downstream_tx.subscribe()));
                    }
                    EngineCommand::SubmitOrder { reply, .. } => {
                        let _ = reply.send(Ok("client-order-1".to_string()));
                    }
                    _ => {}
                }
            }
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"order ACC market AAPL 10\n").await.unwrap();

        let mut buf = vec![0u8; 128];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ack: client-order-1\n");
    }

    #[tokio::test]
    async fn unknown_command_gets_error_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (commands_tx, mut commands_rx) = mpsc::unbounded_channel::<EngineCommand>();
        tokio::spawn(accept_loop(listener, commands_tx));

        tokio::spawn(async move {
            let (downstream_tx, _keep_alive) = tokio::sync::broadcast::channel(16);
            while let Some(cmd) = commands_rx.recv().await {
                if let EngineCommand::OpenClient { reply } = cmd {
                    let _ = reply.send((1, downstream_tx.subscribe()));
                }
            }
        });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"bogus\n").await.unwrap();
        let mut buf = vec![0u8; 128];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("error: 0 unknown command"));
    }
}
