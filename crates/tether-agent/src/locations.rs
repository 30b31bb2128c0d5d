//! Overlay location dispatch
//!
//! Turns the `locations` map of an overlay into [`LocationConstraint`]s,
//! decrypting backend secrets on the way. Tags this build does not know are
//! skipped; a location that is configured but unusable fails the whole batch.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::info;

use tether_common::location::{
    AzureDetails, BackendCredentials, LocationConstraint, LocationDetails, LocationKind,
    LocationType, ObjectStorageDetails, PfsDetails, SproxydDetails, DEFAULT_AWS_ENDPOINT,
    DEFAULT_GCP_ENDPOINT,
};
use tether_common::overlay::OverlayLocation;
use tether_common::{Error, Result};

use crate::credentials::SecretDecryptor;

/// Port of the pfs daemon fronting NFS locations
const PFS_DAEMON_PORT: u16 = 80;

/// Build constraints for every supported location of an overlay
pub fn patch_locations(
    locations: &BTreeMap<String, OverlayLocation>,
    decryptor: &SecretDecryptor,
) -> Result<BTreeMap<String, LocationConstraint>> {
    let mut out = BTreeMap::new();
    for (name, location) in locations {
        let Some(location_type) = LocationType::from_tag(&location.location_type) else {
            info!(
                location = %name,
                location_type = %location.location_type,
                "Unknown location type, skipping"
            );
            continue;
        };
        let constraint = build_constraint(name, location_type, location, decryptor)?;
        out.insert(name.clone(), constraint);
    }
    Ok(out)
}

/// Subset of `constraints` usable as replication targets
pub fn replication_endpoints(
    constraints: &BTreeMap<String, LocationConstraint>,
) -> BTreeMap<String, LocationConstraint> {
    constraints
        .iter()
        .filter(|(_, c)| c.is_replication_backend())
        .map(|(name, c)| (name.clone(), c.clone()))
        .collect()
}

fn build_constraint(
    name: &str,
    location_type: LocationType,
    location: &OverlayLocation,
    decryptor: &SecretDecryptor,
) -> Result<LocationConstraint> {
    // only configured locations (those carrying a secret) are checked
    if location_type.requires_bucket()
        && location.detail_str("secretKey").is_some()
        && location.detail_str("bucketName").is_none()
    {
        return Err(Error::location(name, "bucket name is empty"));
    }

    let details = match location_type.kind() {
        LocationKind::Mem | LocationKind::File => LocationDetails::Local {
            supports_versioning: true,
        },
        LocationKind::Azure => azure_details(name, location, decryptor)?,
        LocationKind::AwsS3 => object_storage_details(name, location_type, location, decryptor)?,
        LocationKind::Gcp => object_storage_details(name, location_type, location, decryptor)?,
        LocationKind::Scality => sproxyd_details(location),
        LocationKind::Pfs => LocationDetails::Pfs(PfsDetails {
            host: format!("{}-cosmos-pfsd", name),
            port: PFS_DAEMON_PORT,
        }),
    };

    Ok(LocationConstraint {
        name: name.to_string(),
        location_type,
        object_id: location.object_id.clone(),
        details,
        size_limit_gb: location.size_limit_gb,
        is_transient: location.is_transient.unwrap_or(false),
        legacy_aws_behavior: location.legacy_aws_behavior.unwrap_or(false),
    })
}

fn decrypt_location_secret(
    name: &str,
    ciphertext: &str,
    decryptor: &SecretDecryptor,
) -> Result<String> {
    decryptor
        .decrypt(ciphertext)
        .map_err(|e| Error::location(name, format!("could not decrypt secret key: {}", e)))
}

fn bucket_name(location: &OverlayLocation) -> String {
    location.detail_str("bucketName").unwrap_or_default().to_string()
}

fn unconfigured(location: &OverlayLocation) -> LocationDetails {
    LocationDetails::Unconfigured(location.details.clone())
}

fn azure_details(
    name: &str,
    location: &OverlayLocation,
    decryptor: &SecretDecryptor,
) -> Result<LocationDetails> {
    let Some(secret) = location.detail_str("secretKey") else {
        return Ok(unconfigured(location));
    };
    Ok(LocationDetails::Azure(AzureDetails {
        storage_endpoint: location.detail_str("endpoint").map(str::to_string),
        account_name: location.detail_str("accessKey").unwrap_or_default().to_string(),
        access_key: decrypt_location_secret(name, secret, decryptor)?,
        container_name: bucket_name(location),
        bucket_match: location.detail_flag("bucketMatch"),
    }))
}

/// Split an endpoint that may carry a scheme into `(host, https)`
fn split_endpoint(endpoint: &str) -> (String, bool) {
    match url::Url::parse(endpoint) {
        Ok(url) if endpoint.contains("://") => {
            let host = match (url.host_str(), url.port()) {
                (Some(host), Some(port)) => format!("{}:{}", host, port),
                (Some(host), None) => host.to_string(),
                (None, _) => endpoint.to_string(),
            };
            (host, url.scheme().contains("https"))
        }
        _ => (endpoint.to_string(), true),
    }
}

fn object_storage_details(
    name: &str,
    location_type: LocationType,
    location: &OverlayLocation,
    decryptor: &SecretDecryptor,
) -> Result<LocationDetails> {
    let Some(secret) = location.detail_str("secretKey") else {
        return Ok(unconfigured(location));
    };
    let is_gcp = location_type.kind() == LocationKind::Gcp;
    let default_endpoint = if is_gcp {
        DEFAULT_GCP_ENDPOINT
    } else {
        DEFAULT_AWS_ENDPOINT
    };
    let (endpoint, https) =
        split_endpoint(location.detail_str("endpoint").unwrap_or(default_endpoint));

    Ok(LocationDetails::ObjectStorage(ObjectStorageDetails {
        credentials: BackendCredentials {
            access_key: location.detail_str("accessKey").unwrap_or_default().to_string(),
            secret_key: decrypt_location_secret(name, secret, decryptor)?,
        },
        bucket_name: bucket_name(location),
        mpu_bucket_name: if is_gcp {
            location.detail_str("mpuBucketName").map(str::to_string)
        } else {
            None
        },
        bucket_match: location.detail_flag("bucketMatch"),
        endpoint,
        https,
        region: location.detail_str("region").map(str::to_string),
        server_side_encryption: location.detail_flag("serverSideEncryption"),
        path_style: location_type.path_style(),
        supports_versioning: location_type.supports_versioning(),
    }))
}

fn sproxyd_details(location: &OverlayLocation) -> LocationDetails {
    let bootstrap: Option<Vec<String>> = location
        .details
        .get("bootstrapList")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        });
    match (bootstrap, location.detail_str("proxyPath")) {
        (Some(bootstrap), Some(path)) => LocationDetails::Sproxyd(SproxydDetails {
            bootstrap,
            path: path.to_string(),
            chord_cos: location.details.get("chordCos").and_then(Value::as_u64),
        }),
        _ => unconfigured(location),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::credentials::encrypt_secret;
    use crate::credentials::tests::{test_credentials, test_keypair};

    fn locations(value: Value) -> BTreeMap<String, OverlayLocation> {
        serde_json::from_value(value).unwrap()
    }

    fn secret(plaintext: &str) -> String {
        encrypt_secret(&test_keypair().public_pem, plaintext).unwrap()
    }

    fn decryptor() -> SecretDecryptor {
        test_credentials().decryptor().unwrap()
    }

    #[test]
    fn test_every_supported_tag_dispatches() {
        let mut doc = serde_json::Map::new();
        for t in LocationType::ALL {
            doc.insert(t.tag().to_string(), json!({"locationType": t.tag()}));
        }
        let out = patch_locations(&locations(Value::Object(doc)), &decryptor()).unwrap();
        assert_eq!(out.len(), LocationType::ALL.len());
        for t in LocationType::ALL {
            let c = &out[t.tag()];
            assert_eq!(c.location_type, t);
            assert_eq!(c.kind(), t.kind());
        }
        assert_eq!(
            out["location-mem-v1"].details,
            LocationDetails::Local {
                supports_versioning: true
            }
        );
    }

    #[test]
    fn test_unknown_tag_skipped() {
        let out = patch_locations(
            &locations(json!({
                "tape": {"locationType": "location-tape-v1"},
                "untyped": {},
                "mem": {"locationType": "location-mem-v1"}
            })),
            &decryptor(),
        )
        .unwrap();
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["mem"]);
    }

    #[test]
    fn test_aws_location_with_secret() {
        let out = patch_locations(
            &locations(json!({
                "aws-east": {
                    "locationType": "location-aws-s3-v1",
                    "objectId": "obj-1",
                    "sizeLimitGB": 100,
                    "legacyAwsBehavior": true,
                    "details": {
                        "accessKey": "AKIA",
                        "secretKey": secret("aws-secret"),
                        "bucketName": "remote-bucket",
                        "region": "us-east-1",
                        "serverSideEncryption": true
                    }
                }
            })),
            &decryptor(),
        )
        .unwrap();

        let c = &out["aws-east"];
        assert_eq!(c.object_id.as_deref(), Some("obj-1"));
        assert_eq!(c.size_limit_gb, Some(100));
        assert!(c.legacy_aws_behavior);
        assert!(!c.is_transient);
        match &c.details {
            LocationDetails::ObjectStorage(d) => {
                assert_eq!(d.credentials.access_key, "AKIA");
                assert_eq!(d.credentials.secret_key, "aws-secret");
                assert_eq!(d.bucket_name, "remote-bucket");
                assert_eq!(d.endpoint, "s3.amazonaws.com");
                assert!(d.https);
                assert!(d.server_side_encryption);
                assert!(d.supports_versioning);
                assert!(!d.path_style);
            }
            other => panic!("unexpected details {:?}", other),
        }
    }

    #[test]
    fn test_ring_location_path_style_and_endpoint_scheme() {
        let out = patch_locations(
            &locations(json!({
                "ring": {
                    "locationType": "location-scality-ring-s3-v1",
                    "details": {
                        "secretKey": secret("s"),
                        "bucketName": "b",
                        "endpoint": "http://ring.local:8000"
                    }
                }
            })),
            &decryptor(),
        )
        .unwrap();
        match &out["ring"].details {
            LocationDetails::ObjectStorage(d) => {
                assert!(d.path_style);
                assert_eq!(d.endpoint, "ring.local:8000");
                assert!(!d.https);
            }
            other => panic!("unexpected details {:?}", other),
        }
    }

    #[test]
    fn test_do_spaces_has_no_versioning() {
        let out = patch_locations(
            &locations(json!({
                "spaces": {
                    "locationType": "location-do-spaces-v1",
                    "details": {"secretKey": secret("s"), "bucketName": "b",
                                "endpoint": "nyc3.digitaloceanspaces.com"}
                }
            })),
            &decryptor(),
        )
        .unwrap();
        match &out["spaces"].details {
            LocationDetails::ObjectStorage(d) => {
                assert!(!d.supports_versioning);
                assert_eq!(d.endpoint, "nyc3.digitaloceanspaces.com");
            }
            other => panic!("unexpected details {:?}", other),
        }
    }

    #[test]
    fn test_empty_bucket_fails_batch() {
        let err = patch_locations(
            &locations(json!({
                "mem": {"locationType": "location-mem-v1"},
                "bad": {
                    "locationType": "location-gcp-v1",
                    "details": {"secretKey": secret("s"), "bucketName": ""}
                }
            })),
            &decryptor(),
        )
        .unwrap_err();
        match err {
            Error::Location { location, message } => {
                assert_eq!(location, "bad");
                assert!(message.contains("bucket"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_bucket_check_follows_location_type() {
        let err = patch_locations(
            &locations(json!({
                "blob": {
                    "locationType": "location-azure-v1",
                    "details": {"secretKey": secret("s"), "accessKey": "acct"}
                }
            })),
            &decryptor(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Location { ref location, .. } if location == "blob"));

        // no secret yet, or a type without buckets: nothing to check
        let constraints = patch_locations(
            &locations(json!({
                "pending": {"locationType": "location-aws-s3-v1", "details": {}},
                "local": {"locationType": "location-file-v1"}
            })),
            &decryptor(),
        )
        .unwrap();
        assert!(matches!(constraints["pending"].details, LocationDetails::Unconfigured(_)));
        assert!(matches!(constraints["local"].details, LocationDetails::Local { .. }));
    }

    #[test]
    fn test_undecryptable_secret_fails_batch() {
        let result = patch_locations(
            &locations(json!({
                "azure": {
                    "locationType": "location-azure-v1",
                    "details": {"secretKey": "bm90IGEgY2lwaGVydGV4dA==", "bucketName": "c"}
                }
            })),
            &decryptor(),
        );
        assert!(matches!(result, Err(Error::Location { .. })));
    }

    #[test]
    fn test_azure_location() {
        let out = patch_locations(
            &locations(json!({
                "azure": {
                    "locationType": "location-azure-v1",
                    "details": {
                        "accessKey": "account",
                        "secretKey": secret("azure-key"),
                        "bucketName": "container",
                        "endpoint": "https://account.blob.core.windows.net"
                    }
                }
            })),
            &decryptor(),
        )
        .unwrap();
        match &out["azure"].details {
            LocationDetails::Azure(d) => {
                assert_eq!(d.account_name, "account");
                assert_eq!(d.access_key, "azure-key");
                assert_eq!(d.container_name, "container");
            }
            other => panic!("unexpected details {:?}", other),
        }
    }

    #[test]
    fn test_sproxyd_and_nfs_locations() {
        let out = patch_locations(
            &locations(json!({
                "ring": {
                    "locationType": "location-scality-sproxyd-v1",
                    "details": {"bootstrapList": ["10.0.0.1:81", "10.0.0.2:81"],
                                "proxyPath": "/proxy/arc", "chordCos": 2}
                },
                "nfs": {"locationType": "location-nfs-mount-v1", "details": {}}
            })),
            &decryptor(),
        )
        .unwrap();
        assert_eq!(
            out["ring"].details,
            LocationDetails::Sproxyd(SproxydDetails {
                bootstrap: vec!["10.0.0.1:81".to_string(), "10.0.0.2:81".to_string()],
                path: "/proxy/arc".to_string(),
                chord_cos: Some(2),
            })
        );
        assert_eq!(
            out["nfs"].details,
            LocationDetails::Pfs(PfsDetails {
                host: "nfs-cosmos-pfsd".to_string(),
                port: 80,
            })
        );
    }

    #[test]
    fn test_replication_endpoint_index() {
        let out = patch_locations(
            &locations(json!({
                "mem": {"locationType": "location-mem-v1"},
                "file": {"locationType": "location-file-v1"},
                "aws": {"locationType": "location-aws-s3-v1"},
                "gcp": {"locationType": "location-gcp-v1"},
                "azure": {"locationType": "location-azure-v1"},
                "sproxyd": {"locationType": "location-scality-sproxyd-v1"}
            })),
            &decryptor(),
        )
        .unwrap();
        let replication = replication_endpoints(&out);
        assert_eq!(
            replication.keys().collect::<Vec<_>>(),
            vec!["aws", "azure", "gcp"]
        );
    }
}
