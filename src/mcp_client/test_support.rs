//! A scripted stand-in for a real tool server, used by the session and manager tests.
//!
//! The server is a POSIX `sh` loop: it reads one request per line, pulls the id
//! out with `sed`, and answers by matching on the method. Methods:
//!
//! - `initialize` (errors when `FAKE_FAIL_INIT` is set), `tools/list`,
//!   `tools/call` (tool `echo`; anything else is an "Unknown tool" error),
//!   `resources/list`, `resources/read` (text is `$FAKE_GREETING`, default `hello`)
//! - `echo`: returns the raw request line under `request`
//! - `slow`: sleeps a second, then answers `"late"`
//! - `garbage`: a non-JSON line, then `"after-garbage"`
//! - `split`: writes the response in two pieces with a pause in between
//! - `ask`: pings the client, then returns the client's reply under `reply`
//! - `null_error` / `bare_error`: error responses with a null message / a string error
//! - `exit`: exits with status 3 without answering

use std::time::Duration;

use super::config::SessionConfig;

const FAKE_SERVER_SCRIPT: &str = r##"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9][0-9]*\),.*/\1/p')
  case "$line" in
    *'"method":"notifications/'*)
      ;;
    *'"method":"initialize"'*)
      if [ -n "$FAKE_FAIL_INIT" ]; then
        printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32603,"message":"init exploded"}}\n' "$id"
      else
        printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{},"resources":{}},"serverInfo":{"name":"fake","version":"0.0.1"}}}\n' "$id"
      fi
      ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"Echo the arguments back","inputSchema":{"type":"object"}}]}}\n' "$id"
      ;;
    *'"method":"tools/call"'*'"name":"echo"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"echoed"}],"isError":false}}\n' "$id"
      ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"Unknown tool"}}\n' "$id"
      ;;
    *'"method":"resources/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"resources":[{"uri":"mem://readme","name":"readme","mimeType":"text/plain"}]}}\n' "$id"
      ;;
    *'"method":"resources/read"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"contents":[{"uri":"mem://readme","mimeType":"text/plain","text":"%s"}]}}\n' "$id" "${FAKE_GREETING:-hello}"
      ;;
    *'"method":"echo"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"request":%s}}\n' "$id" "$line"
      ;;
    *'"method":"slow"'*)
      sleep 1
      printf '{"jsonrpc":"2.0","id":%s,"result":"late"}\n' "$id"
      ;;
    *'"method":"garbage"'*)
      printf 'this is not json\n'
      printf '{"jsonrpc":"2.0","id":%s,"result":"after-garbage"}\n' "$id"
      ;;
    *'"method":"split"'*)
      printf '{"jsonrpc":"2.0","id":%s,' "$id"
      sleep 0.2
      printf '"result":"joined"}\n'
      ;;
    *'"method":"ask"'*)
      printf '{"jsonrpc":"2.0","id":"srv-1","method":"ping"}\n'
      IFS= read -r reply
      printf '{"jsonrpc":"2.0","id":%s,"result":{"reply":%s}}\n' "$id" "$reply"
      ;;
    *'"method":"null_error"'*)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32000,"message":null}}\n' "$id"
      ;;
    *'"method":"bare_error"'*)
      printf '{"jsonrpc":"2.0","id":%s,"error":"boom"}\n' "$id"
      ;;
    *'"method":"exit"'*)
      exit 3
      ;;
    *)
      if [ -n "$id" ]; then
        printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"Method not found"}}\n' "$id"
      fi
      ;;
  esac
done
"##;

/// Config for a fake server named `name`, with a 5s request timeout.
pub(crate) fn fake_server(name: &str) -> SessionConfig {
    SessionConfig::new(name, "sh")
        .arg("-c")
        .arg(FAKE_SERVER_SCRIPT)
        .with_timeout(Duration::from_secs(5))
}

/// Whether a process with this pid still exists.
pub(crate) fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
