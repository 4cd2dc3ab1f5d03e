//! Newline-delimited JSON-RPC codec.
//!
//! One JSON document per line in both directions. Reads from a pipe do not
//! respect line boundaries, so [`LineDecoder`] buffers the tail of each chunk
//! until its newline arrives.

use serde::Serialize;
use serde_json::Value;

use super::errors::McpError;
use super::types::{
    IncomingRequest, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    WireMessage, JSONRPC_VERSION,
};

/// Longest line the decoder will buffer before giving up on it.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

// ─── Encoding ────────────────────────────────────────────────────────────────

/// Encode a request as a single newline-terminated line.
pub fn encode_request(id: u64, method: &str, params: Value) -> Result<String, McpError> {
    to_line(&JsonRpcRequest::new(id, method, params))
}

/// Encode a notification as a single newline-terminated line.
pub fn encode_notification(method: &str, params: Option<Value>) -> Result<String, McpError> {
    to_line(&JsonRpcNotification::new(method, params))
}

/// Encode a success response to a server-initiated request.
pub fn encode_result(id: &Value, result: Value) -> Result<String, McpError> {
    to_line(&serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    }))
}

/// Encode an error response to a server-initiated request.
pub fn encode_error(id: &Value, code: i64, message: &str) -> Result<String, McpError> {
    to_line(&serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {"code": code, "message": message},
    }))
}

fn to_line<T: Serialize>(message: &T) -> Result<String, McpError> {
    let mut line = serde_json::to_string(message).map_err(|e| McpError::InvalidResponse {
        method: "encode".into(),
        reason: format!("failed to serialize message: {e}"),
    })?;
    line.push('\n');
    Ok(line)
}

// ─── Decoding ────────────────────────────────────────────────────────────────

/// Decode one line (without its trailing newline) into a message.
pub fn decode_line(line: &str) -> Result<WireMessage, McpError> {
    let parse_error = |reason: String| McpError::ParseError {
        reason,
        line: truncate_for_log(line),
    };

    let value: Value =
        serde_json::from_str(line).map_err(|e| parse_error(format!("invalid JSON: {e}")))?;
    let Value::Object(mut obj) = value else {
        return Err(parse_error("message is not a JSON object".into()));
    };

    let id = obj.remove("id").filter(|id| !id.is_null());

    if let Some(method) = obj.remove("method") {
        let Value::String(method) = method else {
            return Err(parse_error("`method` is not a string".into()));
        };
        let params = obj.remove("params");
        return Ok(match id {
            Some(id) => WireMessage::Request(IncomingRequest { id, method, params }),
            None => WireMessage::Notification { method, params },
        });
    }

    let Some(id) = id else {
        return Err(parse_error("message has neither `method` nor `id`".into()));
    };
    let id = response_id(&id).ok_or_else(|| parse_error(format!("unusable response id {id}")))?;

    // Once the id is known the response is always delivered, however odd its error member.
    let error = match obj.remove("error") {
        None | Some(Value::Null) | Some(Value::Bool(false)) => None,
        Some(raw) => Some(
            serde_json::from_value::<JsonRpcError>(raw.clone()).unwrap_or_else(|e| {
                tracing::debug!(id, error = %e, "unrecognized error object, using fallback");
                JsonRpcError {
                    code: Value::Null,
                    message: "Unknown error".to_string(),
                    data: Some(raw),
                }
            }),
        ),
    };

    Ok(WireMessage::Response(JsonRpcResponse {
        id,
        result: obj.remove("result"),
        error,
    }))
}

/// Our ids are positive integers; accept them as numbers or numeric strings.
fn response_id(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Turn a response into the caller-facing outcome.
///
/// An `error` member wins. Otherwise the result is returned as-is, with a
/// missing `result` read as `null`.
pub fn extract_result(response: JsonRpcResponse) -> Result<Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }
    Ok(response.result.unwrap_or(Value::Null))
}

fn truncate_for_log(line: &str) -> String {
    const MAX: usize = 512;
    if line.len() <= MAX {
        return line.to_string();
    }
    let mut end = MAX;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &line[..end])
}

/// Incremental decoder for a byte stream of newline-delimited JSON.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
    /// Set while skipping the remainder of an oversized line.
    discarding: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back waiting for a newline.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feed one chunk; returns every message completed by it, in order.
    ///
    /// A line that fails to decode becomes an `Err` entry; later lines in the
    /// same chunk are still decoded.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<WireMessage, McpError>> {
        let mut out = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                self.discarding = false;
                continue;
            }
            self.buf.extend_from_slice(head);
            let line = std::mem::take(&mut self.buf);
            if let Some(decoded) = decode_bytes(&line) {
                out.push(decoded);
            }
        }

        if !self.discarding {
            self.buf.extend_from_slice(rest);
            if self.buf.len() > MAX_LINE_BYTES {
                let len = self.buf.len();
                self.buf = Vec::new();
                self.discarding = true;
                out.push(Err(McpError::ParseError {
                    reason: format!("line exceeds {MAX_LINE_BYTES} bytes ({len} buffered)"),
                    line: String::new(),
                }));
            }
        }

        out
    }

    /// Decode whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<Result<WireMessage, McpError>> {
        let line = std::mem::take(&mut self.buf);
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        decode_bytes(&line)
    }
}

/// Blank lines yield `None`.
fn decode_bytes(raw: &[u8]) -> Option<Result<WireMessage, McpError>> {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(decode_line(trimmed))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn response_ids(decoded: &[Result<WireMessage, McpError>]) -> Vec<u64> {
        decoded
            .iter()
            .filter_map(|m| match m {
                Ok(WireMessage::Response(r)) => Some(r.id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_encode_request_is_one_line() {
        let line = encode_request(7, "resources/read", serde_json::json!({"uri": "a\nb"})).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["params"]["uri"], "a\nb");
    }

    #[test]
    fn test_encode_error_response() {
        let line = encode_error(&serde_json::json!("srv-1"), -32601, "Method not found").unwrap();
        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["id"], "srv-1");
        assert_eq!(value["error"]["code"], -32601);
    }

    #[test]
    fn test_decode_success_response() {
        let msg = decode_line(r#"{"jsonrpc":"2.0","id":3,"result":{"tools":[]}}"#).unwrap();
        let WireMessage::Response(resp) = msg else {
            panic!("expected response");
        };
        assert_eq!(resp.id, 3);
        assert!(resp.error.is_none());
        assert_eq!(extract_result(resp).unwrap(), serde_json::json!({"tools": []}));
    }

    #[test]
    fn test_decode_error_response() {
        let msg = decode_line(
            r#"{"jsonrpc":"2.0","id":"4","error":{"code":-32601,"message":"Unknown tool: x"}}"#,
        )
        .unwrap();
        let WireMessage::Response(resp) = msg else {
            panic!("expected response");
        };
        assert_eq!(resp.id, 4);
        match extract_result(resp).unwrap_err() {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Unknown tool: x");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[test]
    fn test_odd_error_members_still_reject() {
        let cases = [
            (r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":null}}"#, Some(-32000)),
            (r#"{"jsonrpc":"2.0","id":1,"error":"boom"}"#, None),
            (r#"{"jsonrpc":"2.0","id":1,"error":{"code":7,"message":42}}"#, None),
        ];
        for (line, expected_code) in cases {
            let Ok(WireMessage::Response(resp)) = decode_line(line) else {
                panic!("expected response for {line}");
            };
            let err = extract_result(resp).unwrap_err();
            assert_eq!(err.server_code(), expected_code, "{line}");
            match err {
                McpError::ServerError { message, .. } => assert_eq!(message, "Unknown error"),
                other => panic!("expected ServerError, got {other:?}"),
            }
        }

        // The raw value survives for callers that want it.
        let Ok(WireMessage::Response(resp)) = decode_line(r#"{"jsonrpc":"2.0","id":2,"error":"boom"}"#)
        else {
            panic!("expected response");
        };
        assert_eq!(resp.error.unwrap().data, Some(serde_json::json!("boom")));
    }

    #[test]
    fn test_missing_result_reads_as_null() {
        let resp = JsonRpcResponse {
            id: 1,
            result: None,
            error: None,
        };
        assert_eq!(extract_result(resp).unwrap(), Value::Null);
    }

    #[test]
    fn test_decode_notification_and_server_request() {
        match decode_line(r#"{"jsonrpc":"2.0","method":"notifications/message","params":{}}"#) {
            Ok(WireMessage::Notification { method, .. }) => {
                assert_eq!(method, "notifications/message")
            }
            other => panic!("expected notification, got {other:?}"),
        }
        match decode_line(r#"{"jsonrpc":"2.0","id":"abc","method":"ping"}"#) {
            Ok(WireMessage::Request(req)) => {
                assert_eq!(req.id, "abc");
                assert_eq!(req.method, "ping");
                assert!(req.params.is_none());
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_non_messages() {
        assert!(matches!(decode_line("not json"), Err(McpError::ParseError { .. })));
        assert!(matches!(decode_line("[1,2]"), Err(McpError::ParseError { .. })));
        assert!(matches!(
            decode_line(r#"{"jsonrpc":"2.0","result":1}"#),
            Err(McpError::ParseError { .. })
        ));
        assert!(matches!(
            decode_line(r#"{"jsonrpc":"2.0","id":-1,"result":1}"#),
            Err(McpError::ParseError { .. })
        ));
    }

    #[test]
    fn test_decoder_buffers_partial_lines() {
        let mut decoder = LineDecoder::new();
        let full = br#"{"jsonrpc":"2.0","id":1,"result":"abc"}"#;
        let (a, b) = full.split_at(17);

        assert!(decoder.push(a).is_empty());
        assert_eq!(decoder.buffered(), a.len());

        let mut second = b.to_vec();
        second.extend_from_slice(b"\n{\"jsonrpc\":\"2.0\",\"id\":2,");
        let decoded = decoder.push(&second);
        assert_eq!(response_ids(&decoded), vec![1]);

        let decoded = decoder.push(b"\"result\":null}\n");
        assert_eq!(response_ids(&decoded), vec![2]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_malformed_line_does_not_stop_decoding() {
        let mut decoder = LineDecoder::new();
        let chunk = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":1}\n\
            server booting...\n\
            \n\
            {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":2}\r\n";
        let decoded = decoder.push(chunk);
        assert_eq!(decoded.len(), 3);
        assert!(decoded[1].is_err());
        assert_eq!(response_ids(&decoded), vec![1, 2]);

        let decoded = decoder.push(b"{oops\n{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":3}\n");
        assert_eq!(response_ids(&decoded), vec![3]);
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut decoder = LineDecoder::new();
        assert!(decoder
            .push(br#"{"jsonrpc":"2.0","id":9,"result":true}"#)
            .is_empty());
        match decoder.finish() {
            Some(Ok(WireMessage::Response(resp))) => assert_eq!(resp.id, 9),
            other => panic!("expected trailing response, got {other:?}"),
        }
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_oversized_line_is_skipped() {
        let mut decoder = LineDecoder::new();
        let big = vec![b'x'; MAX_LINE_BYTES + 1];
        let decoded = decoder.push(&big);
        assert_eq!(decoded.len(), 1);
        assert!(decoded[0].is_err());
        assert_eq!(decoder.buffered(), 0);

        // The rest of the oversized line is dropped; the next line decodes.
        let decoded = decoder.push(b"xxxx\n{\"jsonrpc\":\"2.0\",\"id\":5,\"result\":0}\n");
        assert_eq!(response_ids(&decoded), vec![5]);
    }

    #[test]
    fn test_truncate_for_log_respects_char_boundaries() {
        let line = "é".repeat(400);
        let truncated = truncate_for_log(&line);
        assert!(truncated.ends_with("...(truncated)"));
        assert!(truncated.len() < line.len());
    }
}
