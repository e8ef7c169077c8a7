use crate::core::codec::{encode_command, Frame};
use crate::error::{ProtocolError, Result};
use crate::protocol::message::WireMessage;
use bytes::Bytes;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type DecodeFn<M> = dyn Fn(Bytes, u32) -> Result<M> + Send + Sync + 'static;
type HandlerFn<M, C> = dyn Fn(&M, &Arc<C>) -> bool + Send + Sync + 'static;

struct Route<M, C> {
    decoder: Option<Arc<DecodeFn<M>>>,
    handler: Option<Arc<HandlerFn<M, C>>>,
    handshake: bool,
}

impl<M, C> Default for Route<M, C> {
    fn default() -> Self {
        Self {
            decoder: None,
            handler: None,
            handshake: false,
        }
    }
}

/// Command routing table, built once and immutable afterwards.
///
/// Maps a command to an optional payload decoder and an optional handler.
/// Handshake handlers may run before the connection has negotiated a
/// version; every other command arriving that early closes the connection.
/// A handler returning false also closes the connection.
pub struct MessageRegistry<M, C> {
    routes: HashMap<Cow<'static, str>, Route<M, C>>,
}

impl<M: WireMessage, C> MessageRegistry<M, C> {
    pub fn builder() -> RegistryBuilder<M, C> {
        RegistryBuilder {
            routes: HashMap::new(),
            error: None,
        }
    }

    /// Decode a frame, falling back to the opaque message for unknown commands
    pub fn decode(&self, frame: Frame, version: u32) -> Result<M> {
        match self
            .routes
            .get(frame.command.as_str())
            .and_then(|r| r.decoder.as_ref())
        {
            Some(decoder) => decoder(frame.payload, version),
            None => Ok(M::unknown(frame.command, frame.payload)),
        }
    }

    /// Whether `command` may be handled before the handshake
    pub fn is_handshake(&self, command: &str) -> bool {
        self.routes.get(command).is_some_and(|r| r.handshake)
    }

    /// Run the handler for `message`.
    ///
    /// Returns `None` when no handler is registered, otherwise whether the
    /// connection should stay open.
    pub fn handle(&self, message: &M, connection: &Arc<C>) -> Option<bool> {
        self.routes
            .get(message.command())
            .and_then(|r| r.handler.as_ref())
            .map(|handler| handler(message, connection))
    }

    pub fn contains(&self, command: &str) -> bool {
        self.routes.contains_key(command)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl<M, C> fmt::Debug for MessageRegistry<M, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut commands: Vec<&str> = self.routes.keys().map(|k| k.as_ref()).collect();
        commands.sort_unstable();
        f.debug_struct("MessageRegistry")
            .field("commands", &commands)
            .finish()
    }
}

/// Builder for [`MessageRegistry`]; command validation errors surface from [`build`](Self::build)
pub struct RegistryBuilder<M, C> {
    routes: HashMap<Cow<'static, str>, Route<M, C>>,
    error: Option<ProtocolError>,
}

impl<M: WireMessage, C> RegistryBuilder<M, C> {
    fn route(&mut self, command: &'static str) -> Option<&mut Route<M, C>> {
        if self.error.is_some() {
            return None;
        }
        if let Err(e) = encode_command(command) {
            self.error = Some(e);
            return None;
        }
        Some(self.routes.entry(Cow::Borrowed(command)).or_default())
    }

    /// Register the payload decoder for `command`
    pub fn decoder<F>(mut self, command: &'static str, decoder: F) -> Self
    where
        F: Fn(Bytes, u32) -> Result<M> + Send + Sync + 'static,
    {
        if let Some(route) = self.route(command) {
            route.decoder = Some(Arc::new(decoder));
        }
        self
    }

    /// Register a handler that only runs after the handshake
    pub fn handler<F>(mut self, command: &'static str, handler: F) -> Self
    where
        F: Fn(&M, &Arc<C>) -> bool + Send + Sync + 'static,
    {
        if let Some(route) = self.route(command) {
            route.handler = Some(Arc::new(handler));
            route.handshake = false;
        }
        self
    }

    /// Register a handler allowed before the handshake completes
    pub fn handshake_handler<F>(mut self, command: &'static str, handler: F) -> Self
    where
        F: Fn(&M, &Arc<C>) -> bool + Send + Sync + 'static,
    {
        if let Some(route) = self.route(command) {
            route.handler = Some(Arc::new(handler));
            route.handshake = true;
        }
        self
    }

    pub fn build(self) -> Result<MessageRegistry<M, C>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(MessageRegistry {
                routes: self.routes,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestMsg {
        Ping(u8),
        Other(String, Bytes),
    }

    impl WireMessage for TestMsg {
        fn command(&self) -> &str {
            match self {
                TestMsg::Ping(_) => "ping",
                TestMsg::Other(c, _) => c,
            }
        }
        fn encoded_len(&self, _version: u32) -> usize {
            match self {
                TestMsg::Ping(_) => 1,
                TestMsg::Other(_, p) => p.len(),
            }
        }
        fn encode_payload(&self, _version: u32, dst: &mut BytesMut) {
            match self {
                TestMsg::Ping(n) => dst.extend_from_slice(&[*n]),
                TestMsg::Other(_, p) => dst.extend_from_slice(p),
            }
        }
        fn unknown(command: String, payload: Bytes) -> Self {
            TestMsg::Other(command, payload)
        }
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    fn registry() -> MessageRegistry<TestMsg, Counter> {
        MessageRegistry::builder()
            .decoder("ping", |payload: Bytes, _| {
                payload
                    .first()
                    .map(|b| TestMsg::Ping(*b))
                    .ok_or(ProtocolError::Truncated("ping"))
            })
            .handshake_handler("ping", |msg: &TestMsg, c: &Arc<Counter>| {
                c.0.fetch_add(1, Ordering::SeqCst);
                *msg != TestMsg::Ping(0)
            })
            .handler("pong", |_: &TestMsg, _: &Arc<Counter>| true)
            .build()
            .unwrap()
    }

    #[test]
    fn test_decode_known_and_unknown() {
        let registry = registry();
        let msg = registry.decode(Frame::new("ping", vec![9u8]), 0).unwrap();
        assert_eq!(msg, TestMsg::Ping(9));

        let msg = registry.decode(Frame::new("inv", vec![1u8, 2]), 0).unwrap();
        assert_eq!(msg, TestMsg::Other("inv".into(), Bytes::from_static(&[1, 2])));
    }

    #[test]
    fn test_decoder_error_propagates() {
        assert!(registry().decode(Frame::new("ping", Bytes::new()), 0).is_err());
    }

    #[test]
    fn test_handshake_flags() {
        let registry = registry();
        assert!(registry.is_handshake("ping"));
        assert!(!registry.is_handshake("pong"));
        assert!(!registry.is_handshake("missing"));
    }

    #[test]
    fn test_handle_results() {
        let registry = registry();
        let conn = Arc::new(Counter::default());
        assert_eq!(registry.handle(&TestMsg::Ping(1), &conn), Some(true));
        assert_eq!(registry.handle(&TestMsg::Ping(0), &conn), Some(false));
        assert_eq!(
            registry.handle(&TestMsg::Other("inv".into(), Bytes::new()), &conn),
            None
        );
        assert_eq!(conn.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_invalid_command_rejected_at_build() {
        let result = MessageRegistry::<TestMsg, Counter>::builder()
            .handler("much_too_long_command", |_: &TestMsg, _: &Arc<Counter>| true)
            .build();
        assert!(matches!(result, Err(ProtocolError::InvalidCommand(_))));
    }
}
