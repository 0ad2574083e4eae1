use std::fs;
use std::time::{Duration, Instant};

use gamewire_session::{ServiceRegistry, SessionError, SessionRuntime};
use gamewire_transport::{connect, Endpoint};

use crate::cmd::{parse_duration, CallArgs};
use crate::exit::{
    io_error, session_error, transport_error, CliError, CliResult, SUCCESS, TIMEOUT, USAGE,
};
use crate::output::{print_call, CallOutcome, OutputFormat};

/// Upper bound on closing the CLI's own session once the call is done.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let mut config = args.settings.resolve()?;
    config.handshake_timeout_ms = timeout.as_millis() as u64;
    config.rpc_callback_timeout_ms = timeout.as_millis() as u64;

    let endpoint: Endpoint = args
        .endpoint
        .parse()
        .map_err(|err| transport_error("invalid endpoint", err))?;
    let payload = resolve_payload(&args)?;

    let runtime = SessionRuntime::builder(config)
        .name("gamewire-call")
        .registry(ServiceRegistry::new())
        .build()
        .map_err(|err| session_error("runtime setup failed", err))?;
    let result = call(&runtime, &endpoint, &args, payload, timeout, format);
    runtime.shutdown(CLOSE_TIMEOUT);
    result
}

fn call(
    runtime: &SessionRuntime,
    endpoint: &Endpoint,
    args: &CallArgs,
    payload: Vec<u8>,
    timeout: Duration,
    format: OutputFormat,
) -> CliResult<i32> {
    let started = Instant::now();
    let stream = connect(endpoint).map_err(|err| transport_error("connect failed", err))?;
    let token = args.token.clone().unwrap_or_default().into_bytes();
    let handle = runtime
        .connect(stream, &args.identity, token)
        .wait_timeout(timeout)
        .ok_or_else(|| CliError::new(TIMEOUT, format!("handshake timed out after {timeout:?}")))?
        .clone()
        .map_err(|err| session_error("connect failed", err))?;
    tracing::debug!(session_id = handle.session_id(), "session established");

    let response = if args.one_way {
        handle
            .send_one_way(args.service, args.method, payload)
            .map_err(|err| session_error("send failed", err))?;
        None
    } else {
        let answer = handle
            .call_async_with_timeout(args.service, args.method, payload, timeout)
            .wait_timeout(timeout + CLOSE_TIMEOUT)
            .cloned()
            .unwrap_or(Err(SessionError::Timeout(timeout)))
            .map_err(|err| session_error("call failed", err))?;
        Some(answer)
    };

    print_call(
        &CallOutcome {
            endpoint: &endpoint.to_string(),
            session_id: handle.session_id(),
            service_id: args.service,
            method_id: args.method,
            response: response.as_deref(),
            elapsed: started.elapsed(),
        },
        format,
    );
    Ok(SUCCESS)
}

fn resolve_payload(args: &CallArgs) -> CliResult<Vec<u8>> {
    if let Some(json) = &args.json {
        serde_json::from_str::<serde_json::Value>(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        return Ok(json.as_bytes().to_vec());
    }
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }
    Ok(Vec::new())
}
