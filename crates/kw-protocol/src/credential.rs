//! Credential protobuf messages
//!
//! Credentials and their request/response envelopes use length-delimited
//! protobuf encoding so the stub can relay them unmodified to the remote
//! elevation helper. The messages are declared in-source; there is no
//! generated code or build script.

use prost::Message;

use crate::error::ProtocolError;

/// Candidate server public keys offered by a credential requester.
///
/// Verification narrows the list to the single key the agent recognizes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Challenge {
    /// SSH wire-format public key blobs
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub server_public_keys: Vec<Vec<u8>>,
}

/// A signed statement binding an operation to a verified challenge
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Credential {
    /// Opaque description of the requested operation
    #[prost(bytes = "vec", tag = "1")]
    pub op: Vec<u8>,
    /// The narrowed challenge
    #[prost(message, optional, tag = "2")]
    pub challenge: Option<Challenge>,
    /// 32 fresh random bytes
    #[prost(bytes = "vec", tag = "3")]
    pub signer_nonce: Vec<u8>,
    /// SSH wire-format blob of the signing public key
    #[prost(bytes = "vec", tag = "4")]
    pub signature_key: Vec<u8>,
    /// Signature over the credential with the signature fields empty
    #[prost(bytes = "vec", tag = "5")]
    pub signature: Vec<u8>,
    /// Signature algorithm name, e.g. `ssh-ed25519`
    #[prost(string, tag = "6")]
    pub signature_format: String,
}

/// Request for a signed credential
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CredentialRequest {
    /// Opaque description of the requested operation
    #[prost(bytes = "vec", tag = "1")]
    pub op: Vec<u8>,
    /// Candidate server public keys
    #[prost(message, optional, tag = "2")]
    pub challenge: Option<Challenge>,
}

/// Outcome of a credential request
#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum CredentialStatus {
    /// Not set
    Unspecified = 0,
    /// The credential was issued
    Approved = 1,
    /// The request was refused
    Denied = 2,
}

/// Response to a credential request
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CredentialResponse {
    /// Approval status
    #[prost(enumeration = "CredentialStatus", tag = "1")]
    pub status: i32,
    /// The issued credential, present only when approved
    #[prost(message, optional, tag = "2")]
    pub credential: Option<Credential>,
}

impl Credential {
    /// The bytes covered by the signature: the credential serialized with
    /// both signature fields empty. The nonce and signing key are part of
    /// the signed content.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let unsigned = Credential {
            signature: Vec::new(),
            signature_format: String::new(),
            ..self.clone()
        };
        unsigned.encode_to_vec()
    }
}

impl CredentialRequest {
    /// Decode from a control packet payload
    pub fn decode_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(Self::decode(payload)?)
    }
}

impl CredentialResponse {
    /// A denial carrying no credential
    pub fn denied() -> Self {
        Self {
            status: CredentialStatus::Denied as i32,
            credential: None,
        }
    }

    /// An approval carrying the signed credential
    pub fn approved(credential: Credential) -> Self {
        Self {
            status: CredentialStatus::Approved as i32,
            credential: Some(credential),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_credential() -> Credential {
        Credential {
            op: b"open /etc/hosts".to_vec(),
            challenge: Some(Challenge {
                server_public_keys: vec![vec![1, 2, 3]],
            }),
            signer_nonce: vec![7; 32],
            signature_key: vec![9; 16],
            signature: Vec::new(),
            signature_format: String::new(),
        }
    }

    #[test]
    fn test_request_roundtrip() {
        let req = CredentialRequest {
            op: b"getuid".to_vec(),
            challenge: Some(Challenge {
                server_public_keys: vec![vec![1], vec![2]],
            }),
        };
        let encoded = req.encode_to_vec();
        let decoded = CredentialRequest::decode_payload(&encoded).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_signing_bytes_exclude_signature() {
        let mut cred = sample_credential();
        let before = cred.signing_bytes();

        cred.signature = vec![0xAB; 64];
        cred.signature_format = "ssh-ed25519".to_string();
        let after = cred.signing_bytes();

        // Filling the signature fields must not change what gets signed
        assert_eq!(before, after);
        // ...but the nonce is covered
        cred.signer_nonce = vec![8; 32];
        assert_ne!(cred.signing_bytes(), before);
    }

    #[test]
    fn test_response_constructors() {
        let denied = CredentialResponse::denied();
        assert_eq!(denied.status, CredentialStatus::Denied as i32);
        assert!(denied.credential.is_none());

        let approved = CredentialResponse::approved(sample_credential());
        assert_eq!(approved.status, CredentialStatus::Approved as i32);
        assert!(approved.credential.is_some());
    }

    #[test]
    fn test_malformed_request_rejected() {
        // A lone field tag with no value
        assert!(CredentialRequest::decode_payload(&[0x12]).is_err());
    }
}
