use error_stack::{Result, ResultExt};

use crate::compensate::{Compensator, HttpPendingTransferSource};
use crate::config::Config;
use crate::{monitoring, open_store, Error};

pub async fn run(config: Config) -> Result<Option<String>, Error> {
    let Config {
        storage,
        compensate,
        emitters,
        ..
    } = config;

    let source = HttpPendingTransferSource::new(compensate.url, compensate.http_timeout)
        .change_context(Error::Connection)?;
    let compensator = Compensator::new(
        source,
        open_store(&storage)?,
        emitters,
        compensate.stale_after,
        monitoring::Client::disabled(),
    );

    let unprocessed = compensator
        .find_unprocessed()
        .await
        .change_context(Error::Compensator)?;

    if unprocessed.is_empty() {
        return Ok(Some("no unprocessed transfers".to_string()));
    }

    serde_json::to_string_pretty(&unprocessed)
        .change_context(Error::Compensator)
        .map(Some)
}
