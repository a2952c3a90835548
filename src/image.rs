//! Image API: pull the service image before the container is created.

use bytes::Bytes;
use http::request::Builder;
use http_body_util::Full;
use hyper::Method;
use serde_derive::Serialize;

use super::Docker;
use crate::errors::Error;
use crate::models::CreateImageInfo;
use crate::read::{decode_all, JsonLineDecoder};

/// Parameters used in the [Create Image API](Docker::create_image())
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateImageOptions {
    /// Name of the image to pull.
    pub from_image: String,
    /// Tag or digest. If empty when pulling an image, this causes all tags for the given image
    /// to be pulled.
    pub tag: String,
}

impl CreateImageOptions {
    /// Split an image reference such as `docker.n8n.io/n8nio/n8n:1.64` into image and tag,
    /// defaulting the tag to `latest`.
    pub fn from_reference(reference: &str) -> CreateImageOptions {
        let (name, tag) = split_reference(reference);
        CreateImageOptions {
            from_image: name.to_owned(),
            tag: tag.to_owned(),
        }
    }
}

fn split_reference(reference: &str) -> (&str, &str) {
    if let Some((name, digest)) = reference.split_once('@') {
        return (name, digest);
    }
    // a colon after the last slash separates the tag, any earlier one is a registry port
    let last_slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[last_slash..].rfind(':') {
        Some(i) => (
            &reference[..last_slash + i],
            &reference[last_slash + i + 1..],
        ),
        None => (reference, "latest"),
    }
}

impl Docker {
    /// ---
    ///
    /// # Create Image
    ///
    /// Pull an image from a registry. The progress messages are drained and the pull fails if any
    /// of them carries an error.
    ///
    /// # Arguments
    ///
    ///  - [Create Image Options](CreateImageOptions) struct.
    ///
    /// # Returns
    ///
    ///  - The progress messages, wrapped in a Future.
    pub async fn create_image(
        &self,
        options: CreateImageOptions,
    ) -> Result<Vec<CreateImageInfo>, Error> {
        let url = "/images/create";

        let req = self.build_request(
            url,
            Builder::new().method(Method::POST),
            Some(options),
            Ok(Full::new(Bytes::new())),
        );

        // large images routinely take longer than the request timeout
        let body = self.process_into_bytes(req, None).await?;
        let messages: Vec<CreateImageInfo> = decode_all(JsonLineDecoder::new(), &body)?;
        if let Some(error) = messages.iter().find_map(|info| info.error.as_ref()) {
            return Err(Error::DockerResponseServerError {
                status_code: 500,
                message: error.clone(),
            });
        }
        Ok(messages)
    }
}
