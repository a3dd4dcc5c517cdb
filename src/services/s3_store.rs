//! S3 backend built on `object_store`'s multipart primitives.

use super::backend::{
    BackendError, BackendResult, CONTENT_TYPE_NDJSON, ObjectBackend, Presence, S3_MIN_PART_SIZE,
    check_part_order,
};
use crate::models::session::CompletedPart;
use async_trait::async_trait;
use bytes::Bytes;
use object_store::{
    ClientOptions, ObjectStore, PutPayload,
    aws::{AmazonS3, AmazonS3Builder},
    multipart::{MultipartStore, PartId},
    path::Path,
};
use tracing::debug;

pub struct S3Store {
    store: AmazonS3,
}

impl S3Store {
    /// Build a client for `bucket`. Credentials and an optional custom
    /// endpoint are read from the standard `AWS_*` environment variables.
    pub fn from_env(bucket: &str, region: &str) -> BackendResult<Self> {
        let store = builder(AmazonS3Builder::from_env(), bucket, region).build()?;
        Ok(Self { store })
    }
}

/// Objects created through multipart uploads take the client's default
/// content type, so it is set here rather than per session.
fn builder(base: AmazonS3Builder, bucket: &str, region: &str) -> AmazonS3Builder {
    base.with_bucket_name(bucket)
        .with_region(region)
        .with_client_options(ClientOptions::new().with_default_content_type(CONTENT_TYPE_NDJSON))
}

/// `object_store` indexes parts from zero.
fn part_index(part_number: u32) -> BackendResult<usize> {
    part_number
        .checked_sub(1)
        .map(|idx| idx as usize)
        .ok_or(BackendError::InvalidPartNumber(part_number))
}

/// Parts are identified by position at completion, so the list must be 1..=n.
fn check_contiguous(session_id: &str, parts: &[CompletedPart]) -> BackendResult<()> {
    check_part_order(session_id, parts)?;
    match parts
        .iter()
        .enumerate()
        .find(|(idx, part)| part.part_number as usize != idx + 1)
    {
        Some((_, part)) => Err(BackendError::InvalidPartOrder(part.part_number)),
        None => Ok(()),
    }
}

#[async_trait]
impl ObjectBackend for S3Store {
    fn name(&self) -> &'static str {
        "s3"
    }

    fn min_part_size(&self) -> usize {
        S3_MIN_PART_SIZE
    }

    async fn probe(&self, location: &str) -> BackendResult<Presence> {
        match self.store.head(&Path::from(location)).await {
            Ok(_) => Ok(Presence::Exists),
            Err(object_store::Error::NotFound { .. }) => Ok(Presence::NotFound),
            Err(err) => Err(err.into()),
        }
    }

    // The content type comes from the client's default, see `builder`.
    async fn create_session(&self, location: &str, _content_type: &str) -> BackendResult<String> {
        let id = self.store.create_multipart(&Path::from(location)).await?;
        debug!(location, upload_id = %id, "s3 multipart upload created");
        Ok(id)
    }

    async fn upload_part(
        &self,
        location: &str,
        session_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> BackendResult<String> {
        let part_idx = part_index(part_number)?;
        let part = self
            .store
            .put_part(
                &Path::from(location),
                &session_id.to_string(),
                part_idx,
                PutPayload::from(body),
            )
            .await?;
        Ok(part.content_id)
    }

    async fn complete_session(
        &self,
        location: &str,
        session_id: &str,
        parts: &[CompletedPart],
    ) -> BackendResult<()> {
        check_contiguous(session_id, parts)?;

        let part_ids = parts
            .iter()
            .map(|p| PartId {
                content_id: p.etag.clone(),
            })
            .collect();
        self.store
            .complete_multipart(&Path::from(location), &session_id.to_string(), part_ids)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::{ClientConfigKey, aws::AmazonS3ConfigKey};

    fn parts(numbers: &[u32]) -> Vec<CompletedPart> {
        numbers
            .iter()
            .map(|&part_number| CompletedPart {
                part_number,
                etag: format!("etag-{part_number}"),
            })
            .collect()
    }

    #[test]
    fn part_numbers_map_to_zero_based_indexes() {
        assert_eq!(part_index(1).unwrap(), 0);
        assert_eq!(part_index(10_000).unwrap(), 9_999);
        assert!(matches!(
            part_index(0),
            Err(BackendError::InvalidPartNumber(0))
        ));
    }

    #[test]
    fn completion_requires_gapless_parts_from_one() {
        assert!(check_contiguous("s", &parts(&[1, 2, 3])).is_ok());
        assert!(matches!(
            check_contiguous("s", &parts(&[1, 3])),
            Err(BackendError::InvalidPartOrder(3))
        ));
        assert!(matches!(
            check_contiguous("s", &parts(&[2, 3])),
            Err(BackendError::InvalidPartOrder(2))
        ));
    }

    #[test]
    fn client_declares_ndjson_content_type() {
        let builder = builder(AmazonS3Builder::new(), "chat-logs", "eu-west-1");
        assert_eq!(
            builder
                .get_config_value(&AmazonS3ConfigKey::Client(ClientConfigKey::DefaultContentType))
                .as_deref(),
            Some(CONTENT_TYPE_NDJSON)
        );
        assert_eq!(
            builder.get_config_value(&AmazonS3ConfigKey::Bucket).as_deref(),
            Some("chat-logs")
        );
    }
}
