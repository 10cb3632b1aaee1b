//! ActivityPub federation module
//!
//! Handles:
//! - Actor resolution and provisioning
//! - WebFinger discovery
//! - HTTP Signatures
//! - Activity delivery (outbound)
//! - Activity processing (inbox)
//! - Detached tasks and outbox import

mod activity;
mod client;
mod delivery;
mod directory;
mod follow;
mod importer;
mod signature;
mod tasks;
mod types;
mod webfinger;

pub use activity::{InboundActivity, InboxDispatcher};
pub use client::{ACTIVITY_JSON, FederationClient, LD_JSON_ACTIVITY};
pub use delivery::{ActivityDelivery, DeliveryResult, builder, new_activity_id};
pub use directory::{ActorDirectory, parse_actor_document, person_document};
pub use follow::{FollowInitiator, FollowOutcome};
pub use importer::{ImportReport, PostImporter};
pub use signature::{
    GeneratedKeyPair, SignatureError, SignatureHeaders, SignatureVerifier, SigningKey,
    VerifiedSigner, generate_digest, generate_keypair, host_header_value, sign_request,
    verify_signature,
};
pub use tasks::{FederationTask, PendingDelivery, TaskExecutor, TaskQueue, TaskStats};
pub use types::{IdRef, OneOrMany};
pub use webfinger::{
    WebFingerResolver, WebFingerResponse, WebFingerResult, generate_webfinger_response,
    parse_handle,
};
