use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gamewire_frame::ConnectRequest;
use gamewire_session::{CallContext, Responder, ServiceRegistry, SessionRuntime};
use gamewire_transport::{connect, Endpoint, WireListener};
use serde::Serialize;

use crate::cmd::{ServeArgs, BUILTIN_SERVICE, ECHO_METHOD, LOG_METHOD, WHOAMI_METHOD};
use crate::exit::{session_error, transport_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_listening, print_sessions, OutputFormat};

/// How long `serve` waits for its loops to close sessions on exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct Whoami<'a> {
    session_id: &'a str,
    identity: &'a str,
    role: &'a str,
    peer: &'a str,
}

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.settings.resolve()?;
    let endpoint: Endpoint = args
        .endpoint
        .parse()
        .map_err(|err| transport_error("invalid endpoint", err))?;

    let mut builder = SessionRuntime::builder(config)
        .name("gamewire-serve")
        .registry(builtin_registry().map_err(|err| session_error("registry setup failed", err))?);
    if let Some(token) = args.token {
        builder = builder.validator(move |request: &ConnectRequest| {
            if request.token[..] == *token.as_bytes() {
                Ok(())
            } else {
                Err("invalid token".to_string())
            }
        });
    }
    let runtime = builder
        .build()
        .map_err(|err| session_error("runtime setup failed", err))?;

    let listener =
        WireListener::bind(&endpoint).map_err(|err| transport_error("bind failed", err))?;
    let bound = listener.local_endpoint();
    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone(), bound.clone())?;
    print_listening(
        &bound.to_string(),
        runtime.config(),
        &runtime.registry().methods(),
        format,
    );

    while running.load(Ordering::SeqCst) {
        let stream = match listener.accept() {
            Ok(stream) => stream,
            Err(err) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %err, "accept failed");
                }
                continue;
            }
        };
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let peer = stream.peer_label();
        if let Err(err) = runtime.attach_responder(stream) {
            tracing::warn!(peer = %peer, error = %err, "could not attach connection");
        }
    }

    tracing::info!(endpoint = %bound, "stopping");
    if args.report_sessions {
        print_sessions(&runtime.sessions(Duration::from_secs(1)), format);
    }
    if !runtime.shutdown(SHUTDOWN_TIMEOUT) {
        tracing::warn!(timeout = ?SHUTDOWN_TIMEOUT, "event loops did not terminate in time");
    }
    Ok(SUCCESS)
}

/// Methods under [`BUILTIN_SERVICE`]: echo, whoami and a one-way log sink.
pub fn builtin_registry() -> gamewire_session::Result<ServiceRegistry> {
    let mut registry = ServiceRegistry::new();
    registry.register(BUILTIN_SERVICE, ECHO_METHOD, |_ctx, body, responder| {
        responder.ok(body);
    })?;
    registry.register(BUILTIN_SERVICE, WHOAMI_METHOD, whoami)?;
    registry.register(BUILTIN_SERVICE, LOG_METHOD, |ctx, body, responder| {
        tracing::info!(
            session = %ctx.session,
            size = body.len(),
            message = %String::from_utf8_lossy(&body),
            "log message"
        );
        if responder.expects_reply() {
            responder.ok(Vec::new());
        }
    })?;
    Ok(registry)
}

fn whoami(ctx: &CallContext, _body: bytes::Bytes, responder: Responder) {
    responder.json(&Whoami {
        session_id: &ctx.session.session_id,
        identity: &ctx.session.identity,
        role: ctx.session.role.name(),
        peer: &ctx.session.peer,
    });
}

/// Clears `running` and pokes the listener with a throwaway connection so a
/// blocked `accept` returns.
fn install_ctrlc_handler(running: Arc<AtomicBool>, wake: Endpoint) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
        if let Ok(stream) = connect(&wake) {
            let _ = stream.shutdown();
        }
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_holds_the_reserved_methods() {
        let registry = builtin_registry().expect("builtin registry should build");
        assert_eq!(
            registry.methods(),
            vec![
                (BUILTIN_SERVICE, ECHO_METHOD),
                (BUILTIN_SERVICE, WHOAMI_METHOD),
                (BUILTIN_SERVICE, LOG_METHOD),
            ]
        );
    }
}
