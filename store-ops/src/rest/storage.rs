use async_trait::async_trait;
use reqwest::Method;

use super::{error_message, execute, RestClient};
use crate::{tasks::ProofStorage, DataAccessError};

#[async_trait]
impl ProofStorage for RestClient {
    #[tracing::instrument(level = "debug", skip(self, bytes), fields(bytes = bytes.len()), err)]
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), DataAccessError> {
        let object = format!(
            "/storage/v1/object/{}/{}",
            self.config().proof_bucket(),
            path.trim_start_matches('/')
        );

        let request = self
            .request(Method::POST, &object)
            .header("Content-Type", content_type)
            .header("x-upsert", "false")
            .body(bytes);
        let reply = execute(request)
            .await
            .map_err(|err| DataAccessError::Transport(err.to_string()))?;

        if !reply.status.is_success() {
            return Err(DataAccessError::Rejected {
                status: reply.status.as_u16(),
                message: error_message(reply.status, &reply.body),
            });
        }

        Ok(())
    }
}
