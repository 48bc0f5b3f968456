//! Conversions between docservice types and the MongoDB driver's option and error types.

use bson::{Bson, de::deserialize_from_bson};
use mongodb::{
    IndexModel,
    error::{Error, ErrorKind, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT, WriteFailure},
    options::{FindOptions as MongoFindOptions, IndexOptions},
};

use docservice_core::{
    driver::FindOptions,
    error::{ServiceError, ServiceResult},
    index::IndexSpec,
};

const DUPLICATE_KEY: i32 = 11000;


pub(crate) fn find_options(options: FindOptions) -> MongoFindOptions {
    let mut converted = MongoFindOptions::default();

    converted.sort = options.sort;
    converted.skip = options.skip;
    converted.limit = options.limit;
    converted.projection = options.projection;

    converted
}

pub(crate) fn index_model(name: &str, index: &IndexSpec) -> ServiceResult<IndexModel> {
    let mut options = index.options_document(name);
    if name.is_empty() {
        // let the server derive the name from the keys
        options.remove("name");
    }

    let options: IndexOptions = deserialize_from_bson(Bson::Document(options))?;

    Ok(IndexModel::builder()
        .keys(index.keys.clone())
        .options(options)
        .build())
}

/// Maps a driver error onto [`ServiceError`], keeping transient transaction failures retryable.
pub(crate) fn map_error(error: Error, collection: &str) -> ServiceError {
    if error.contains_label(TRANSIENT_TRANSACTION_ERROR)
        || error.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
    {
        return ServiceError::TransientTransaction(error.to_string());
    }

    match error.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(failure)) if failure.code == DUPLICATE_KEY => {
            ServiceError::DocumentAlreadyExists(failure.message.clone(), collection.to_string())
        },
        ErrorKind::InvalidArgument { message, .. } => ServiceError::InvalidQuery(message.clone()),
        _ => ServiceError::Backend(error.to_string()),
    }
}
