//! Inbound request handlers.

use std::net::SocketAddr;

use tracing::{debug, trace};

use crate::common::{
    AckResponseArguments, ErrorSpecific, FindNodeRequestArguments, FindNodeResponseArguments,
    GetProvidersRequestArguments, GetProvidersResponseArguments, GetRequestArguments,
    GetResponseArguments, Id, MapRequestArguments, Message, MessageType, Peer,
    PutRequestArguments, RemoveRequestArguments, RequestSpecific, RequestTypeSpecific,
    ResponseSpecific, ERROR_GENERIC, ERROR_KEY_NOT_FOUND, ERROR_METHOD_UNKNOWN, ERROR_VALIDATION,
};
use crate::Error;

use super::{Rpc, DEFAULT_PORT};

impl Rpc {
    /// Decode a datagram received on the listening socket and answer it.
    pub fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let message = match Message::from_bytes(bytes) {
            Ok(message) => message,
            Err(Error::UnknownMethod {
                transaction_id,
                method,
            }) => {
                debug!(?from, %method, "Unknown method");
                self.socket().error(
                    from,
                    transaction_id,
                    ErrorSpecific {
                        code: ERROR_METHOD_UNKNOWN,
                        description: format!("Method Unknown: {method}"),
                    },
                );
                return;
            }
            Err(error) => {
                trace!(context = "socket_validation", ?error, ?from, "Invalid message");
                return;
            }
        };

        match message.message_type {
            MessageType::Request(request) => {
                handle_request(self, from, message.transaction_id, request)
            }
            _ => {
                trace!(
                    context = "socket_validation",
                    ?from,
                    "Response on the listening socket"
                );
            }
        }
    }
}

fn handle_request(rpc: &Rpc, from: SocketAddr, transaction_id: u32, request: RequestSpecific) {
    let requester_id = request.requester_id;
    let requester = rpc.peer_address(from.ip(), request.requester_port.unwrap_or(DEFAULT_PORT));
    let genuine = requester_id == Id::from_address(requester.ip(), requester.port());

    let ack = ResponseSpecific::Ack(AckResponseArguments {
        responder_id: *rpc.id(),
    });

    match request.request_type {
        RequestTypeSpecific::Ping => {
            let added = genuine && rpc.add_peer(Peer::with_id(requester_id, requester));

            rpc.socket().response(from, transaction_id, ack);

            if added {
                let announced = rpc.send_map(requester);
                trace!(?requester, announced, "Announced records to new peer");
            }
        }
        RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }) => {
            let nodes = rpc
                .find_node(&target, rpc.config().max_closest_nodes)
                .into_iter()
                .map(|peer| peer.address)
                .collect();

            rpc.socket().response(
                from,
                transaction_id,
                ResponseSpecific::FindNode(FindNodeResponseArguments {
                    responder_id: *rpc.id(),
                    nodes,
                }),
            );
        }
        RequestTypeSpecific::Put(PutRequestArguments { key, value }) => {
            if rpc.put(&key, &value) {
                rpc.socket().response(from, transaction_id, ack);
            } else {
                debug!(%key, ?requester, request_type = "put", "Rejected record");
                rpc.socket().error(
                    from,
                    transaction_id,
                    ErrorSpecific {
                        code: ERROR_VALIDATION,
                        description: "Invalid value".to_string(),
                    },
                );
            }
        }
        RequestTypeSpecific::Get(GetRequestArguments { key }) => {
            match rpc.get_local(&key).or_else(|| rpc.get_cached(&key)) {
                Some(value) => rpc.socket().response(
                    from,
                    transaction_id,
                    ResponseSpecific::Get(GetResponseArguments {
                        responder_id: *rpc.id(),
                        value,
                    }),
                ),
                None => rpc.socket().error(
                    from,
                    transaction_id,
                    ErrorSpecific {
                        code: ERROR_KEY_NOT_FOUND,
                        description: "Key not found".to_string(),
                    },
                ),
            }
        }
        RequestTypeSpecific::GetProviders(GetProvidersRequestArguments { key }) => {
            let mut values = rpc.get_providers(&key);

            if rpc.has_key(&key) {
                let public_address = rpc.public_address();

                if !values.contains(&public_address) {
                    values.push(public_address);
                }
            }

            rpc.socket().response(
                from,
                transaction_id,
                ResponseSpecific::GetProviders(GetProvidersResponseArguments {
                    responder_id: *rpc.id(),
                    values,
                }),
            );
        }
        RequestTypeSpecific::Map(MapRequestArguments { key, value }) => {
            if !genuine {
                debug!(?requester, ?requester_id, request_type = "map", "Id mismatch");
                rpc.socket().error(
                    from,
                    transaction_id,
                    ErrorSpecific {
                        code: ERROR_GENERIC,
                        description: "Requester id does not match its address".to_string(),
                    },
                );
                return;
            }

            match rpc.validate(&key, &value) {
                Ok(_) => {
                    rpc.add_provider(&key, requester);
                    rpc.socket().response(from, transaction_id, ack);
                }
                Err(error) => {
                    debug!(%key, ?requester, %error, request_type = "map", "Rejected record");
                    rpc.socket().error(
                        from,
                        transaction_id,
                        ErrorSpecific {
                            code: ERROR_VALIDATION,
                            description: error.to_string(),
                        },
                    );
                }
            }
        }
        RequestTypeSpecific::Remove(RemoveRequestArguments { key }) => {
            rpc.remove(&key);
            rpc.remove_provider(&key, &requester);

            rpc.socket().response(from, transaction_id, ack);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crate::rpc::test::{signed_user, testnet_config};
    use crate::rpc::{QueryError, RECV_BUFFER_SIZE};
    use crate::signing::Ed25519Signer;

    use super::*;

    const KEY: &str = "5555555555555555555555555555555555555555555555555555555555555555";

    /// Run `rpc`'s receive loop until `count` datagrams were handled.
    fn serve(rpc: Arc<Rpc>, count: usize) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let mut handled = 0;

            while handled < count {
                let mut buf = [0u8; RECV_BUFFER_SIZE];

                if let Some((amt, from)) = rpc.socket().recv_from(&mut buf) {
                    rpc.handle_datagram(&buf[..amt], from);
                    handled += 1;
                }
            }
        })
    }

    fn pair() -> (Rpc, Arc<Rpc>) {
        (
            Rpc::new(testnet_config()).unwrap(),
            Arc::new(Rpc::new(testnet_config()).unwrap()),
        )
    }

    #[test]
    fn ping_admits_requester() {
        let (client, server) = pair();
        let handle = serve(server.clone(), 1);

        assert!(client.ping(server.public_address()));
        handle.join().unwrap();

        assert!(server.has_peer(&client.public_address()));
    }

    #[test]
    fn put_then_get() {
        let (client, server) = pair();
        let handle = serve(server.clone(), 3);
        let value = signed_user(&Ed25519Signer::random(), "2024-01-01T00:00:00Z");

        let address = server.public_address();

        assert!(client
            .request(
                address,
                RequestTypeSpecific::Put(PutRequestArguments {
                    key: KEY.to_string(),
                    value: value.clone(),
                }),
                Duration::from_secs(1),
            )
            .is_ok());

        assert_eq!(client.send_get(KEY, address), Some(value));
        assert_eq!(client.send_get(&"66".repeat(32), address), None);

        handle.join().unwrap();
    }

    #[test]
    fn invalid_put_is_rejected() {
        let (client, server) = pair();
        let handle = serve(server.clone(), 1);

        let result = client.request(
            server.public_address(),
            RequestTypeSpecific::Put(PutRequestArguments {
                key: KEY.to_string(),
                value: "not a record".to_string(),
            }),
            Duration::from_secs(1),
        );

        handle.join().unwrap();

        assert!(matches!(
            result,
            Err(QueryError::Remote {
                code: ERROR_VALIDATION,
                ..
            })
        ));
        assert!(!server.has_key(KEY));
    }

    #[test]
    fn multibyte_signature_is_rejected() {
        let (client, server) = pair();
        let handle = serve(server.clone(), 2);

        let signer = Ed25519Signer::random();
        let mut value: serde_json::Value =
            serde_json::from_str(&signed_user(&signer, "2024-01-01T00:00:00Z")).unwrap();
        let signature = format!("Sig{}é{}", "a".repeat(31), "b".repeat(127));
        value["signature"] = serde_json::json!(signature);

        let result = client.request(
            server.public_address(),
            RequestTypeSpecific::Put(PutRequestArguments {
                key: KEY.to_string(),
                value: value.to_string(),
            }),
            Duration::from_secs(1),
        );

        assert!(matches!(
            result,
            Err(QueryError::Remote {
                code: ERROR_VALIDATION,
                ..
            })
        ));

        // Still serving.
        assert!(client.ping(server.public_address()));
        handle.join().unwrap();

        assert!(!server.has_key(KEY));
    }

    #[test]
    fn map_registers_provider() {
        let (client, server) = pair();
        let handle = serve(server.clone(), 2);
        let value = signed_user(&Ed25519Signer::random(), "2024-01-01T00:00:00Z");

        client.add_peer(Peer::new(server.public_address()));
        assert!(client.map(KEY, &value));

        // The server holds nothing itself, but knows who does.
        assert!(!server.has_key(KEY));
        assert_eq!(server.get_providers(KEY), vec![client.public_address()]);

        let providers = client.send_get_providers(KEY);
        assert_eq!(providers, vec![client.public_address()]);

        handle.join().unwrap();
    }

    #[test]
    fn get_providers_includes_holder() {
        let (client, server) = pair();
        let handle = serve(server.clone(), 1);
        let value = signed_user(&Ed25519Signer::random(), "2024-01-01T00:00:00Z");

        assert!(server.put(KEY, &value));
        client.add_peer(Peer::new(server.public_address()));

        assert_eq!(
            client.send_get_providers(KEY),
            vec![server.public_address()]
        );

        handle.join().unwrap();
    }

    #[test]
    fn unknown_method() {
        let (client, server) = pair();
        let handle = serve(server.clone(), 1);

        let bytes = rmp_serde::to_vec_named(&serde_json::json!({
            "tid": 7,
            "query": "announce",
            "args": { "id": client.id().to_string() },
        }))
        .unwrap();

        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        socket.send_to(&bytes, server.public_address()).unwrap();

        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let (amt, _) = socket.recv_from(&mut buf).unwrap();
        let message = Message::from_bytes(&buf[..amt]).unwrap();

        assert_eq!(message.transaction_id, 7);
        assert!(matches!(
            message.message_type,
            MessageType::Error(ErrorSpecific {
                code: ERROR_METHOD_UNKNOWN,
                ..
            })
        ));

        handle.join().unwrap();
    }
}
