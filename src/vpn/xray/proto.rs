//! Xray management API messages
//!
//! Only the subset needed to alter VLESS inbound users is declared. Field
//! numbers follow the upstream `app/proxyman/command` and `proxy/vless`
//! protobuf definitions.

use prost::Message;

pub const ADD_USER_OPERATION: &str = "xray.app.proxyman.command.AddUserOperation";
pub const REMOVE_USER_OPERATION: &str = "xray.app.proxyman.command.RemoveUserOperation";
pub const VLESS_ACCOUNT: &str = "xray.proxy.vless.Account";

/// `HandlerService/AlterInbound` RPC path
pub const ALTER_INBOUND_PATH: &str = "/xray.app.proxyman.command.HandlerService/AlterInbound";

/// Serialized message tagged with its full type name
#[derive(Clone, PartialEq, Message)]
pub struct TypedMessage {
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

impl TypedMessage {
    pub fn pack<M: Message>(type_name: &str, message: &M) -> Self {
        Self {
            r#type: type_name.to_string(),
            value: message.encode_to_vec(),
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct User {
    #[prost(uint32, tag = "1")]
    pub level: u32,
    #[prost(string, tag = "2")]
    pub email: String,
    #[prost(message, optional, tag = "3")]
    pub account: Option<TypedMessage>,
}

#[derive(Clone, PartialEq, Message)]
pub struct VlessAccount {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub flow: String,
    #[prost(string, tag = "3")]
    pub encryption: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct AddUserOperation {
    #[prost(message, optional, tag = "1")]
    pub user: Option<User>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RemoveUserOperation {
    #[prost(string, tag = "1")]
    pub email: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct AlterInboundRequest {
    #[prost(string, tag = "1")]
    pub tag: String,
    #[prost(message, optional, tag = "2")]
    pub operation: Option<TypedMessage>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AlterInboundResponse {}

impl AlterInboundRequest {
    /// Add a VLESS user to inbound `tag`
    pub fn add_vless_user(tag: &str, uuid: &str, email: &str, flow: &str) -> Self {
        let account = VlessAccount {
            id: uuid.to_string(),
            flow: flow.to_string(),
            encryption: "none".to_string(),
        };
        let user = User {
            level: 0,
            email: email.to_string(),
            account: Some(TypedMessage::pack(VLESS_ACCOUNT, &account)),
        };
        Self {
            tag: tag.to_string(),
            operation: Some(TypedMessage::pack(
                ADD_USER_OPERATION,
                &AddUserOperation { user: Some(user) },
            )),
        }
    }

    /// Remove the user identified by `email` from inbound `tag`
    pub fn remove_user(tag: &str, email: &str) -> Self {
        Self {
            tag: tag.to_string(),
            operation: Some(TypedMessage::pack(
                REMOVE_USER_OPERATION,
                &RemoveUserOperation {
                    email: email.to_string(),
                },
            )),
        }
    }
}
