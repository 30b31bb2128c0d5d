//! Location constraint model
//!
//! A location is a storage backend an S3 bucket can be placed on. Overlays
//! name each location's type with a string tag; [`LocationType`] is the closed
//! set of tags this build understands, and carries the per-type flags the
//! gateway needs (versioning support, path-style addressing, whether the
//! backend can be a replication target).

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default endpoint for AWS-compatible locations without an explicit one
pub const DEFAULT_AWS_ENDPOINT: &str = "s3.amazonaws.com";

/// Default endpoint for GCP locations without an explicit one
pub const DEFAULT_GCP_ENDPOINT: &str = "storage.googleapis.com";

/// Backend implementation family of a location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    /// In-memory backend
    Mem,
    /// Local file backend
    File,
    /// Azure Blob storage
    Azure,
    /// AWS S3 or an S3-compatible service
    AwsS3,
    /// Google Cloud Storage
    Gcp,
    /// Scality sproxyd connector
    Scality,
    /// NFS mount served through a pfs daemon
    Pfs,
}

impl LocationKind {
    /// Whether locations of this kind can receive replicated objects
    pub fn is_replication_backend(self) -> bool {
        matches!(self, LocationKind::Azure | LocationKind::AwsS3 | LocationKind::Gcp)
    }

    /// Kind name as used in the gateway's location configuration
    pub fn as_str(self) -> &'static str {
        match self {
            LocationKind::Mem => "mem",
            LocationKind::File => "file",
            LocationKind::Azure => "azure",
            LocationKind::AwsS3 => "aws_s3",
            LocationKind::Gcp => "gcp",
            LocationKind::Scality => "scality",
            LocationKind::Pfs => "pfs",
        }
    }
}

impl fmt::Display for LocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Location type tag carried by overlays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocationType {
    /// `location-mem-v1`
    #[serde(rename = "location-mem-v1")]
    Mem,
    /// `location-file-v1`
    #[serde(rename = "location-file-v1")]
    File,
    /// `location-azure-v1`
    #[serde(rename = "location-azure-v1")]
    Azure,
    /// `location-aws-s3-v1`
    #[serde(rename = "location-aws-s3-v1")]
    AwsS3,
    /// `location-wasabi-v1`
    #[serde(rename = "location-wasabi-v1")]
    Wasabi,
    /// `location-do-spaces-v1`
    #[serde(rename = "location-do-spaces-v1")]
    DoSpaces,
    /// `location-ceph-radosgw-s3-v1`
    #[serde(rename = "location-ceph-radosgw-s3-v1")]
    CephRadosGw,
    /// `location-scality-ring-s3-v1`
    #[serde(rename = "location-scality-ring-s3-v1")]
    ScalityRingS3,
    /// `location-gcp-v1`
    #[serde(rename = "location-gcp-v1")]
    Gcp,
    /// `location-scality-sproxyd-v1`
    #[serde(rename = "location-scality-sproxyd-v1")]
    ScalitySproxyd,
    /// `location-nfs-mount-v1`
    #[serde(rename = "location-nfs-mount-v1")]
    NfsMount,
}

impl LocationType {
    /// Every supported tag
    pub const ALL: [LocationType; 11] = [
        LocationType::Mem,
        LocationType::File,
        LocationType::Azure,
        LocationType::AwsS3,
        LocationType::Wasabi,
        LocationType::DoSpaces,
        LocationType::CephRadosGw,
        LocationType::ScalityRingS3,
        LocationType::Gcp,
        LocationType::ScalitySproxyd,
        LocationType::NfsMount,
    ];

    /// Look up a tag; `None` for tags this build does not support
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.tag() == tag)
    }

    /// Wire tag of this type
    pub fn tag(self) -> &'static str {
        match self {
            LocationType::Mem => "location-mem-v1",
            LocationType::File => "location-file-v1",
            LocationType::Azure => "location-azure-v1",
            LocationType::AwsS3 => "location-aws-s3-v1",
            LocationType::Wasabi => "location-wasabi-v1",
            LocationType::DoSpaces => "location-do-spaces-v1",
            LocationType::CephRadosGw => "location-ceph-radosgw-s3-v1",
            LocationType::ScalityRingS3 => "location-scality-ring-s3-v1",
            LocationType::Gcp => "location-gcp-v1",
            LocationType::ScalitySproxyd => "location-scality-sproxyd-v1",
            LocationType::NfsMount => "location-nfs-mount-v1",
        }
    }

    /// Backend family
    pub fn kind(self) -> LocationKind {
        match self {
            LocationType::Mem => LocationKind::Mem,
            LocationType::File => LocationKind::File,
            LocationType::Azure => LocationKind::Azure,
            LocationType::AwsS3
            | LocationType::Wasabi
            | LocationType::DoSpaces
            | LocationType::CephRadosGw
            | LocationType::ScalityRingS3 => LocationKind::AwsS3,
            LocationType::Gcp => LocationKind::Gcp,
            LocationType::ScalitySproxyd => LocationKind::Scality,
            LocationType::NfsMount => LocationKind::Pfs,
        }
    }

    /// Whether the backend supports object versioning
    pub fn supports_versioning(self) -> bool {
        !matches!(self, LocationType::Azure | LocationType::DoSpaces)
    }

    /// Whether requests to the backend use path-style addressing
    pub fn path_style(self) -> bool {
        matches!(self, LocationType::CephRadosGw | LocationType::ScalityRingS3)
    }

    /// Whether the backend can be a replication target
    pub fn is_replication_backend(self) -> bool {
        self.kind().is_replication_backend()
    }

    /// Whether a configured location of this type must name a bucket
    pub fn requires_bucket(self) -> bool {
        matches!(
            self.kind(),
            LocationKind::AwsS3 | LocationKind::Gcp | LocationKind::Azure
        )
    }
}

impl fmt::Display for LocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Access key pair for a remote backend
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendCredentials {
    /// Access key id
    pub access_key: String,
    /// Decrypted secret key
    pub secret_key: String,
}

impl fmt::Debug for BackendCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendCredentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Details of an S3-compatible or GCP location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStorageDetails {
    /// Credentials with the decrypted secret
    pub credentials: BackendCredentials,
    /// Remote bucket name
    pub bucket_name: String,
    /// Remote bucket for multipart staging (GCP only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mpu_bucket_name: Option<String>,
    /// Store objects under their bucket-prefixed key
    pub bucket_match: bool,
    /// Host of the remote service, scheme stripped
    pub endpoint: String,
    /// Use TLS to reach the remote service
    pub https: bool,
    /// Remote region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Request server-side encryption on writes
    pub server_side_encryption: bool,
    /// Use path-style addressing
    pub path_style: bool,
    /// Remote supports versioning
    pub supports_versioning: bool,
}

/// Details of an Azure Blob location
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureDetails {
    /// Blob service endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_endpoint: Option<String>,
    /// Storage account name
    pub account_name: String,
    /// Decrypted storage account key
    pub access_key: String,
    /// Container name
    pub container_name: String,
    /// Store objects under their bucket-prefixed key
    pub bucket_match: bool,
}

impl fmt::Debug for AzureDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureDetails")
            .field("storage_endpoint", &self.storage_endpoint)
            .field("account_name", &self.account_name)
            .field("access_key", &"<redacted>")
            .field("container_name", &self.container_name)
            .field("bucket_match", &self.bucket_match)
            .finish()
    }
}

/// Connection details of a sproxyd location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SproxydDetails {
    /// `host:port` of each connector
    pub bootstrap: Vec<String>,
    /// Connector path
    pub path: String,
    /// Class of service, when pinned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chord_cos: Option<u64>,
}

/// Host and port of the pfs daemon serving an NFS location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PfsDetails {
    /// Daemon host
    pub host: String,
    /// Daemon port
    pub port: u16,
}

/// Type-specific part of a [`LocationConstraint`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "form", rename_all = "snake_case")]
pub enum LocationDetails {
    /// Local backend (mem, file)
    Local {
        /// Always true for local backends
        supports_versioning: bool,
    },
    /// S3-compatible or GCP backend
    ObjectStorage(ObjectStorageDetails),
    /// Azure backend
    Azure(AzureDetails),
    /// sproxyd backend
    Sproxyd(SproxydDetails),
    /// NFS backend
    Pfs(PfsDetails),
    /// Details passed through unchanged because the location is not fully
    /// configured yet (e.g. no secret provided)
    Unconfigured(Map<String, Value>),
}

/// A fully dispatched location, as applied to the live configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationConstraint {
    /// Location name
    pub name: String,
    /// Overlay tag
    pub location_type: LocationType,
    /// Control-service identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    /// Type-specific details
    pub details: LocationDetails,
    /// Capacity limit in GB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_limit_gb: Option<u64>,
    /// Transient source location
    pub is_transient: bool,
    /// Legacy AWS location behavior
    pub legacy_aws_behavior: bool,
}

impl LocationConstraint {
    /// Backend family
    pub fn kind(&self) -> LocationKind {
        self.location_type.kind()
    }

    /// Whether this location is indexed as a replication endpoint
    pub fn is_replication_backend(&self) -> bool {
        self.location_type.is_replication_backend()
    }
}
