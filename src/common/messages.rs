//! Serialize and deserialize DHT messages.

mod internal;

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::common::Id;
use crate::Error;

/// Version string sent with every message.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Generic error, including malformed requests.
pub const ERROR_GENERIC: i32 = 201;
/// The requested key is not stored by the responder.
pub const ERROR_KEY_NOT_FOUND: i32 = 202;
/// The record was rejected by validation.
pub const ERROR_VALIDATION: i32 = 203;
/// The query method is not known to the responder.
pub const ERROR_METHOD_UNKNOWN: i32 = 204;

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    pub transaction_id: u32,

    /// The version of the requester or responder.
    pub version: Option<String>,

    pub message_type: MessageType,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),

    Response(ResponseSpecific),

    Error(ErrorSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub struct ErrorSpecific {
    pub code: i32,
    pub description: String,
}

#[derive(Debug, PartialEq, Clone)]
pub struct RequestSpecific {
    pub requester_id: Id,
    /// Port the requester listens on, when it is not the default one.
    pub requester_port: Option<u16>,
    pub request_type: RequestTypeSpecific,
}

#[derive(Debug, PartialEq, Clone)]
pub enum RequestTypeSpecific {
    Ping,
    FindNode(FindNodeRequestArguments),
    Put(PutRequestArguments),
    Get(GetRequestArguments),
    GetProviders(GetProvidersRequestArguments),
    Map(MapRequestArguments),
    Remove(RemoveRequestArguments),
}

impl RequestTypeSpecific {
    pub fn method(&self) -> &'static str {
        match self {
            RequestTypeSpecific::Ping => "ping",
            RequestTypeSpecific::FindNode(_) => "find_node",
            RequestTypeSpecific::Put(_) => "put",
            RequestTypeSpecific::Get(_) => "get",
            RequestTypeSpecific::GetProviders(_) => "get_providers",
            RequestTypeSpecific::Map(_) => "map",
            RequestTypeSpecific::Remove(_) => "remove",
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub enum ResponseSpecific {
    /// Bare acknowledgement, the reply to `ping`, `put`, `map` and `remove`.
    Ack(AckResponseArguments),
    FindNode(FindNodeResponseArguments),
    Get(GetResponseArguments),
    GetProviders(GetProvidersResponseArguments),
}

impl ResponseSpecific {
    pub fn responder_id(&self) -> &Id {
        match self {
            ResponseSpecific::Ack(args) => &args.responder_id,
            ResponseSpecific::FindNode(args) => &args.responder_id,
            ResponseSpecific::Get(args) => &args.responder_id,
            ResponseSpecific::GetProviders(args) => &args.responder_id,
        }
    }
}

// === ACK ===

#[derive(Debug, PartialEq, Clone)]
pub struct AckResponseArguments {
    pub responder_id: Id,
}

// === FIND_NODE ===

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeRequestArguments {
    pub target: Id,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FindNodeResponseArguments {
    pub responder_id: Id,
    pub nodes: Vec<SocketAddr>,
}

// === PUT ===

#[derive(Debug, PartialEq, Clone)]
pub struct PutRequestArguments {
    pub key: String,
    pub value: String,
}

// === GET ===

#[derive(Debug, PartialEq, Clone)]
pub struct GetRequestArguments {
    pub key: String,
}

#[derive(Debug, PartialEq, Clone)]
pub struct GetResponseArguments {
    pub responder_id: Id,
    pub value: String,
}

// === GET_PROVIDERS ===

#[derive(Debug, PartialEq, Clone)]
pub struct GetProvidersRequestArguments {
    pub key: String,
}

#[derive(Debug, PartialEq, Clone)]
pub struct GetProvidersResponseArguments {
    pub responder_id: Id,
    pub values: Vec<SocketAddr>,
}

// === MAP ===

#[derive(Debug, PartialEq, Clone)]
pub struct MapRequestArguments {
    pub key: String,
    pub value: String,
}

// === REMOVE ===

#[derive(Debug, PartialEq, Clone)]
pub struct RemoveRequestArguments {
    pub key: String,
}

impl Message {
    fn into_serde_message(self) -> internal::DHTMessage {
        let mut message = internal::DHTMessage {
            tid: self.transaction_id,
            version: self.version,
            ..Default::default()
        };

        match self.message_type {
            MessageType::Request(RequestSpecific {
                requester_id,
                requester_port,
                request_type,
            }) => {
                let mut args = internal::DHTArguments {
                    id: Some(requester_id.to_string()),
                    port: requester_port,
                    ..Default::default()
                };

                message.query = Some(request_type.method().to_string());

                match request_type {
                    RequestTypeSpecific::Ping => {}
                    RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }) => {
                        args.target = Some(target.to_string());
                    }
                    RequestTypeSpecific::Put(PutRequestArguments { key, value })
                    | RequestTypeSpecific::Map(MapRequestArguments { key, value }) => {
                        args.key = Some(key);
                        args.value = Some(value);
                    }
                    RequestTypeSpecific::Get(GetRequestArguments { key })
                    | RequestTypeSpecific::GetProviders(GetProvidersRequestArguments { key })
                    | RequestTypeSpecific::Remove(RemoveRequestArguments { key }) => {
                        args.key = Some(key);
                    }
                }

                message.args = Some(args);
            }

            MessageType::Response(response) => {
                let mut args = internal::DHTResponse {
                    id: response.responder_id().to_string(),
                    ..Default::default()
                };

                match response {
                    ResponseSpecific::Ack(_) => {}
                    ResponseSpecific::FindNode(FindNodeResponseArguments { nodes, .. }) => {
                        args.nodes = Some(peers_to_serde(&nodes));
                    }
                    ResponseSpecific::Get(GetResponseArguments { value, .. }) => {
                        args.value = Some(value);
                    }
                    ResponseSpecific::GetProviders(GetProvidersResponseArguments {
                        values, ..
                    }) => {
                        args.values = Some(peers_to_serde(&values));
                    }
                }

                message.response = Some(args);
            }

            MessageType::Error(ErrorSpecific { code, description }) => {
                message.error = Some(internal::DHTError {
                    code,
                    message: description,
                });
            }
        };

        message
    }

    fn from_serde_message(msg: internal::DHTMessage) -> Result<Message, Error> {
        let transaction_id = msg.tid;

        let message_type = if let Some(error) = msg.error {
            MessageType::Error(ErrorSpecific {
                code: error.code,
                description: error.message,
            })
        } else if let Some(response) = msg.response {
            let responder_id = Id::from_str(&response.id)?;

            MessageType::Response(if let Some(values) = response.values {
                ResponseSpecific::GetProviders(GetProvidersResponseArguments {
                    responder_id,
                    values: peers_from_serde(values)?,
                })
            } else if let Some(value) = response.value {
                ResponseSpecific::Get(GetResponseArguments {
                    responder_id,
                    value,
                })
            } else if let Some(nodes) = response.nodes {
                ResponseSpecific::FindNode(FindNodeResponseArguments {
                    responder_id,
                    nodes: peers_from_serde(nodes)?,
                })
            } else {
                ResponseSpecific::Ack(AckResponseArguments { responder_id })
            })
        } else if let Some(query) = msg.query {
            let args = msg
                .args
                .ok_or_else(|| Error::InvalidMessage(format!("{query} without args")))?;

            let requester_id = Id::from_str(&required(args.id, "id")?)?;

            let request_type = match query.as_str() {
                "ping" => RequestTypeSpecific::Ping,
                "find_node" => RequestTypeSpecific::FindNode(FindNodeRequestArguments {
                    target: Id::from_str(&required(args.target, "target")?)?,
                }),
                "put" => RequestTypeSpecific::Put(PutRequestArguments {
                    key: required(args.key, "key")?,
                    value: required(args.value, "value")?,
                }),
                "get" => RequestTypeSpecific::Get(GetRequestArguments {
                    key: required(args.key, "key")?,
                }),
                "get_providers" => {
                    RequestTypeSpecific::GetProviders(GetProvidersRequestArguments {
                        key: required(args.key, "key")?,
                    })
                }
                "map" => {
                    if args.port.is_none() {
                        return Err(Error::InvalidMessage("map without port".to_string()));
                    }

                    RequestTypeSpecific::Map(MapRequestArguments {
                        key: required(args.key, "key")?,
                        value: required(args.value, "value")?,
                    })
                }
                "remove" => RequestTypeSpecific::Remove(RemoveRequestArguments {
                    key: required(args.key, "key")?,
                }),
                _ => {
                    return Err(Error::UnknownMethod {
                        transaction_id,
                        method: query,
                    })
                }
            };

            MessageType::Request(RequestSpecific {
                requester_id,
                requester_port: args.port,
                request_type,
            })
        } else {
            return Err(Error::InvalidMessage(
                "neither query, response nor error".to_string(),
            ));
        };

        Ok(Message {
            transaction_id,
            version: msg.version,
            message_type,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(self.clone().into_serde_message().to_bytes()?)
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message, Error> {
        Message::from_serde_message(internal::DHTMessage::from_bytes(bytes.as_ref())?)
    }
}

fn required(field: Option<String>, name: &str) -> Result<String, Error> {
    field.ok_or_else(|| Error::InvalidMessage(format!("missing {name}")))
}

fn peers_to_serde(peers: &[SocketAddr]) -> Vec<internal::DHTPeer> {
    peers
        .iter()
        .map(|peer| internal::DHTPeer {
            ip_address: peer.ip().to_string(),
            port: peer.port(),
        })
        .collect()
}

fn peers_from_serde(peers: Vec<internal::DHTPeer>) -> Result<Vec<SocketAddr>, Error> {
    peers
        .into_iter()
        .map(|peer| {
            let ip = IpAddr::from_str(&peer.ip_address)
                .map_err(|_| Error::InvalidMessage(format!("ip_address {:?}", peer.ip_address)))?;

            Ok(SocketAddr::new(ip, peer.port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(request_type: RequestTypeSpecific) -> Message {
        Message {
            transaction_id: 258,
            version: Some(VERSION.to_string()),
            message_type: MessageType::Request(RequestSpecific {
                requester_id: Id::random(),
                requester_port: Some(50882),
                request_type,
            }),
        }
    }

    #[test]
    fn test_ping_request() {
        let original_msg = request(RequestTypeSpecific::Ping);

        let serde_msg = original_msg.clone().into_serde_message();
        assert_eq!(serde_msg.query.as_deref(), Some("ping"));

        let bytes = serde_msg.to_bytes().unwrap();
        let parsed_msg = Message::from_bytes(bytes).unwrap();
        assert_eq!(parsed_msg, original_msg);
    }

    #[test]
    fn test_map_request() {
        let original_msg = request(RequestTypeSpecific::Map(MapRequestArguments {
            key: "ab".repeat(32),
            value: r#"{"metadata":"listing"}"#.to_string(),
        }));

        let bytes = original_msg.to_bytes().unwrap();
        assert_eq!(Message::from_bytes(bytes).unwrap(), original_msg);
    }

    #[test]
    fn test_map_request_requires_port() {
        let mut msg = request(RequestTypeSpecific::Map(MapRequestArguments {
            key: "ab".repeat(32),
            value: "{}".to_string(),
        }));
        if let MessageType::Request(request) = &mut msg.message_type {
            request.requester_port = None;
        }

        assert!(matches!(
            Message::from_bytes(msg.to_bytes().unwrap()),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_find_node_response() {
        let original_msg = Message {
            transaction_id: 7,
            version: None,
            message_type: MessageType::Response(ResponseSpecific::FindNode(
                FindNodeResponseArguments {
                    responder_id: Id::random(),
                    nodes: vec![
                        ([127, 0, 0, 1], 50881).into(),
                        ([10, 0, 0, 2], 50882).into(),
                    ],
                },
            )),
        };

        let serde_msg = original_msg.clone().into_serde_message();
        let nodes = serde_msg.response.as_ref().and_then(|r| r.nodes.clone()).unwrap();
        assert_eq!(nodes[0].ip_address, "127.0.0.1");
        assert_eq!(nodes[0].port, 50881);

        let parsed_msg = Message::from_bytes(serde_msg.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed_msg, original_msg);
    }

    #[test]
    fn test_get_providers_response_is_not_confused_with_ack() {
        let original_msg = Message {
            transaction_id: 9,
            version: None,
            message_type: MessageType::Response(ResponseSpecific::GetProviders(
                GetProvidersResponseArguments {
                    responder_id: Id::random(),
                    values: vec![],
                },
            )),
        };

        let parsed_msg = Message::from_bytes(original_msg.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed_msg, original_msg);
    }

    #[test]
    fn test_error_message() {
        let original_msg = Message {
            transaction_id: 3,
            version: Some(VERSION.to_string()),
            message_type: MessageType::Error(ErrorSpecific {
                code: ERROR_KEY_NOT_FOUND,
                description: "Key not found".to_string(),
            }),
        };

        let parsed_msg = Message::from_bytes(original_msg.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed_msg, original_msg);
    }

    #[test]
    fn test_unknown_method() {
        let msg = internal::DHTMessage {
            tid: 11,
            query: Some("announce_peer".to_string()),
            args: Some(internal::DHTArguments {
                id: Some(Id::random().to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        match Message::from_bytes(msg.to_bytes().unwrap()) {
            Err(Error::UnknownMethod {
                transaction_id,
                method,
            }) => {
                assert_eq!(transaction_id, 11);
                assert_eq!(method, "announce_peer");
            }
            other => panic!("expected UnknownMethod, got {other:?}"),
        }
    }

    #[test]
    fn test_garbage() {
        assert!(Message::from_bytes(b"definitely not msgpack").is_err());
    }
}
