//! Protobuf forms of ratchet messages and session records.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WhisperMessage {
    #[prost(bytes = "vec", tag = "1")]
    pub ratchet_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub counter: u32,
    #[prost(uint32, tag = "3")]
    pub previous_counter: u32,
    #[prost(bytes = "vec", tag = "4")]
    pub ciphertext: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PreKeyWhisperMessage {
    #[prost(uint32, tag = "5")]
    pub registration_id: u32,
    #[prost(uint32, optional, tag = "1")]
    pub pre_key_id: ::core::option::Option<u32>,
    #[prost(uint32, tag = "6")]
    pub signed_pre_key_id: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub base_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub identity_key: ::prost::alloc::vec::Vec<u8>,
    /// Encoded [`WhisperMessage`].
    #[prost(bytes = "vec", tag = "4")]
    pub message: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SessionStructure {
    #[prost(bytes = "vec", tag = "1")]
    pub local_identity: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub remote_identity: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub root_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint32, tag = "4")]
    pub previous_counter: u32,
    #[prost(bytes = "vec", tag = "5")]
    pub ratchet_private: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub remote_ratchet_key: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    #[prost(message, optional, tag = "7")]
    pub sender_chain: ::core::option::Option<session_structure::Chain>,
    #[prost(message, optional, tag = "8")]
    pub receiver_chain: ::core::option::Option<session_structure::Chain>,
    #[prost(message, repeated, tag = "9")]
    pub skipped_keys: ::prost::alloc::vec::Vec<session_structure::SkippedKey>,
    #[prost(message, optional, tag = "10")]
    pub pending_pre_key: ::core::option::Option<session_structure::PendingPreKey>,
    #[prost(bytes = "vec", tag = "11")]
    pub alice_base_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint32, tag = "12")]
    pub local_registration_id: u32,
    #[prost(uint32, tag = "13")]
    pub remote_registration_id: u32,
}

/// Nested message types in `SessionStructure`.
pub mod session_structure {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Chain {
        #[prost(bytes = "vec", tag = "1")]
        pub key: ::prost::alloc::vec::Vec<u8>,
        #[prost(uint32, tag = "2")]
        pub index: u32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SkippedKey {
        #[prost(bytes = "vec", tag = "1")]
        pub ratchet_key: ::prost::alloc::vec::Vec<u8>,
        #[prost(uint32, tag = "2")]
        pub index: u32,
        #[prost(bytes = "vec", tag = "3")]
        pub message_key: ::prost::alloc::vec::Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PendingPreKey {
        #[prost(uint32, optional, tag = "1")]
        pub pre_key_id: ::core::option::Option<u32>,
        #[prost(uint32, tag = "2")]
        pub signed_pre_key_id: u32,
        #[prost(bytes = "vec", tag = "3")]
        pub base_key: ::prost::alloc::vec::Vec<u8>,
    }
}
