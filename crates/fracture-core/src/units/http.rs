//! HTTP/1.1 message units.

use bytes::{Bytes, BytesMut};
use fracture_proto::{ProtocolError, http::HttpMessage};

use crate::{
    error::{AdjustmentError, PipelineError},
    state::{ConnectionState, Direction, PrepareContext},
    unit::{UnitKind, WireUnit},
};

impl WireUnit for HttpMessage {
    fn kind(&self) -> UnitKind {
        UnitKind::Http
    }

    fn compute_defaults(&mut self, ctx: &mut PrepareContext<'_>) -> Result<(), PipelineError> {
        self.body.compute_if_unset(Bytes::new);
        let body_len = self.body.resolve("http.body")?.len();

        if !self.is_response() {
            self.header_mut("Host").value.set_computed(ctx.config.http.host.clone());
        }
        if body_len > 0 || self.is_response() || self.header("Content-Length").is_some() {
            self.header_mut("Content-Length").value.set_computed(body_len.to_string());
        }
        Ok(())
    }

    fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut out = BytesMut::new();
        HttpMessage::encode(self, &mut out)?;
        Ok(out.freeze())
    }

    fn apply_effects(
        &self,
        state: &mut ConnectionState,
        direction: Direction,
    ) -> Result<(), AdjustmentError> {
        let http = &mut state.http;
        match (direction, self.is_response()) {
            (Direction::Outbound, false) => http.requests_sent += 1,
            (Direction::Outbound, true) => http.responses_sent += 1,
            (Direction::Inbound, false) => http.requests_received += 1,
            (Direction::Inbound, true) => {
                http.responses_received += 1;
                let Some(status) = self.status_code() else {
                    return Err(AdjustmentError::Inconsistent {
                        unit: "HTTP response",
                        reason: "status line has no numeric status code".to_string(),
                    });
                };
                http.last_status = Some(status);
            },
        }
        Ok(())
    }

    // Decoding drops the whitespace layout around header colons.
    fn preserves_encoding(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ConnectionConfig;

    fn prepared(mut message: HttpMessage) -> HttpMessage {
        let mut state = ConnectionState::new(ConnectionConfig::client()).unwrap();
        message.compute_defaults(&mut state.prepare_context()).unwrap();
        message
    }

    #[test]
    fn request_gets_host_but_no_empty_length() {
        let request = prepared(HttpMessage::request("GET", "/"));
        assert_eq!(
            WireUnit::encode(&request).unwrap(),
            Bytes::from_static(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        );
    }

    #[test]
    fn explicit_host_is_kept() {
        let mut request = HttpMessage::request("POST", "/submit").with_body(&b"abc"[..]);
        request.header_mut("Host").value.set_explicit("evil.example".to_string());
        let request = prepared(request);
        assert_eq!(
            WireUnit::encode(&request).unwrap(),
            Bytes::from_static(
                b"POST /submit HTTP/1.1\r\nHost: evil.example\r\nContent-Length: 3\r\n\r\nabc"
            )
        );
    }

    #[test]
    fn response_status_is_recorded() {
        let mut state = ConnectionState::new(ConnectionConfig::client()).unwrap();
        let response = prepared(HttpMessage::response(404, "Not Found"));
        response.apply_effects(&mut state, Direction::Inbound).unwrap();
        assert_eq!(state.http().last_status(), Some(404));
        assert_eq!(state.http().responses_received(), 1);
    }

    #[test]
    fn garbled_status_line_is_inconsistent() {
        let mut state = ConnectionState::new(ConnectionConfig::client()).unwrap();
        let mut response = HttpMessage::response(200, "OK");
        response.start_line.set_explicit("HTTP/1.1 abc OK".to_string());
        assert!(matches!(
            response.apply_effects(&mut state, Direction::Inbound),
            Err(AdjustmentError::Inconsistent { unit: "HTTP response", .. })
        ));
    }
}
