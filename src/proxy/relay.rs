//! Channel relaying between the client connection and the backend connection.
//!
//! Each relayed channel gets two pumps. One reads the client's channel and
//! replays every message on the backend channel; the other reads the backend
//! channel and replays it to the client through the server handle. Each pump
//! is a single sequential reader, so per-channel order is preserved.

use russh::client;
use russh::server::{self, Handle};
use russh::{Channel, ChannelId, ChannelMsg, ChannelWriteHalf, CryptoVec};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("backend channel: {0}")]
    Backend(#[from] russh::Error),
    #[error("client channel {0:?} is gone")]
    ClientClosed(ChannelId),
}

/// Relay one channel pair until either side closes it.
pub fn spawn(client_channel: Channel<server::Msg>, backend_channel: Channel<client::Msg>, client: Handle) {
    tokio::spawn(relay(client_channel, backend_channel, client));
}

pub async fn relay(
    mut client_channel: Channel<server::Msg>,
    backend_channel: Channel<client::Msg>,
    client: Handle,
) {
    let client_id = client_channel.id();
    let (mut backend_rx, backend_tx) = backend_channel.split();

    // A closed channel ends its reader with `None`; the engine never hands
    // out a close message, so each pump simply runs until its reader ends.
    let upstream = async {
        while let Some(msg) = client_channel.wait().await {
            if let Err(e) = to_backend(msg, &backend_tx).await {
                debug!("Relay to backend for {:?} ended: {}", client_id, e);
                break;
            }
        }
    };

    let downstream = async {
        while let Some(msg) = backend_rx.wait().await {
            if let Err(e) = to_client(msg, &client, client_id).await {
                debug!("Relay to client for {:?} ended: {}", client_id, e);
                break;
            }
        }
    };

    tokio::select! {
        _ = upstream => debug!("Client closed channel {:?}", client_id),
        _ = downstream => debug!("Backend closed channel for {:?}", client_id),
    }

    // Closing a side that is already gone is a no-op.
    let _ = backend_tx.close().await;
    let _ = client.close(client_id).await;
    debug!("Relayed channel {:?} closed", client_id);
}

/// Replay a message from the client on the backend channel.
async fn to_backend(
    msg: ChannelMsg,
    backend: &ChannelWriteHalf<client::Msg>,
) -> Result<(), RelayError> {
    match msg {
        ChannelMsg::Data { data } => backend.data(&data[..]).await?,
        ChannelMsg::ExtendedData { data, ext } => backend.extended_data(ext, &data[..]).await?,
        ChannelMsg::Eof => backend.eof().await?,
        ChannelMsg::RequestPty {
            want_reply,
            term,
            col_width,
            row_height,
            pix_width,
            pix_height,
            terminal_modes,
        } => {
            backend
                .request_pty(
                    want_reply,
                    &term,
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                    &terminal_modes,
                )
                .await?
        }
        ChannelMsg::SetEnv {
            want_reply,
            variable_name,
            variable_value,
        } => {
            backend
                .set_env(want_reply, variable_name, variable_value)
                .await?
        }
        ChannelMsg::RequestShell { want_reply } => backend.request_shell(want_reply).await?,
        ChannelMsg::Exec {
            want_reply,
            command,
        } => backend.exec(want_reply, command).await?,
        ChannelMsg::RequestSubsystem { want_reply, name } => {
            backend.request_subsystem(want_reply, &name).await?
        }
        ChannelMsg::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        } => {
            backend
                .window_change(col_width, row_height, pix_width, pix_height)
                .await?
        }
        ChannelMsg::Signal { signal } => backend.signal(signal).await?,
        ChannelMsg::RequestX11 {
            want_reply,
            single_connection,
            x11_authentication_protocol,
            x11_authentication_cookie,
            x11_screen_number,
        } => {
            backend
                .request_x11(
                    want_reply,
                    single_connection,
                    x11_authentication_protocol,
                    x11_authentication_cookie,
                    x11_screen_number,
                )
                .await?
        }
        ChannelMsg::AgentForward { want_reply } => backend.agent_forward(want_reply).await?,
        other => debug!("Not relaying {:?} to backend", other),
    }
    Ok(())
}

/// Replay a message from the backend to the client channel.
async fn to_client(msg: ChannelMsg, client: &Handle, id: ChannelId) -> Result<(), RelayError> {
    let closed = || RelayError::ClientClosed(id);
    match msg {
        ChannelMsg::Data { data } => client
            .data(id, CryptoVec::from_slice(&data))
            .await
            .map_err(|_| closed())?,
        ChannelMsg::ExtendedData { data, ext } => client
            .extended_data(id, ext, CryptoVec::from_slice(&data))
            .await
            .map_err(|_| closed())?,
        ChannelMsg::Eof => client.eof(id).await.map_err(|_| closed())?,
        ChannelMsg::ExitStatus { exit_status } => client
            .exit_status_request(id, exit_status)
            .await
            .map_err(|_| closed())?,
        ChannelMsg::ExitSignal {
            signal_name,
            core_dumped,
            error_message,
            lang_tag,
        } => client
            .exit_signal_request(id, signal_name, core_dumped, error_message, lang_tag)
            .await
            .map_err(|_| closed())?,
        ChannelMsg::Success => client.channel_success(id).await.map_err(|_| closed())?,
        ChannelMsg::Failure => client.channel_failure(id).await.map_err(|_| closed())?,
        ChannelMsg::WindowAdjusted { .. } => {}
        other => debug!("Not relaying {:?} to client", other),
    }
    Ok(())
}
