use std::{path::Path, sync::Arc};

use anyhow::{anyhow, bail, Context, Result};
use fastpull_core::{
    Blob, BlobQuery, BlobStore, DynamicKey, Error, FastpullConfig, FetchRequest, HashAlgorithm,
    IntegrityDatabase, IntegrityScope, Metadata, SpiderOptions, StoreError, Verifier, WebSpider,
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::cli::{
    BlobCommand, CommandGroupCli, DynamicCommand, DynamicGetArgs, DynamicStoreArgs, FetchArgs,
    VerifyArgs,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Ok,
    UserError,
    Failure,
}

impl CommandStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::UserError => 1,
            Self::Failure => 2,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExecutionOutcome {
    pub status: CommandStatus,
    pub message: String,
    pub details: Value,
}

impl ExecutionOutcome {
    fn ok(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::Ok,
            message: message.into(),
            details,
        }
    }

    fn user_error(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::UserError,
            message: message.into(),
            details,
        }
    }

    fn failure(err: &Error) -> Self {
        Self {
            status: CommandStatus::Failure,
            message: err.to_string(),
            details: json!({ "code": err.code() }),
        }
    }
}

pub async fn execute(config: &FastpullConfig, command: &CommandGroupCli) -> Result<ExecutionOutcome> {
    match command {
        CommandGroupCli::Fetch(args) => fetch(config, args).await,
        CommandGroupCli::Dynamic(DynamicCommand::Store(args)) => dynamic_store(config, args).await,
        CommandGroupCli::Dynamic(DynamicCommand::Get(args)) => dynamic_get(config, args).await,
        CommandGroupCli::Blob(command) => blob(config, command),
        CommandGroupCli::Verify(args) => verify(args).await,
    }
}

fn open_scope(
    config: &FastpullConfig,
    scope_id: &str,
) -> fastpull_core::Result<Arc<IntegrityScope<WebSpider>>> {
    let spider = WebSpider::new(SpiderOptions::from_config(config))?;
    IntegrityDatabase::open(config, spider)?.get_scope(scope_id)
}

fn blob_details(blob: &Blob) -> Value {
    json!({
        "sha512": blob.sha512(),
        "hashes": blob.hashes,
        "size": blob.size,
        "path": blob.path,
        "created_at": blob.created_at,
    })
}

async fn fetch(config: &FastpullConfig, args: &FetchArgs) -> Result<ExecutionOutcome> {
    let mut request = FetchRequest::new(&args.url);
    if let Some(name) = &args.name {
        request = request.with_final_name(name);
    }
    if let Some(sha512) = &args.sha512 {
        request = request.with_expected_hash(HashAlgorithm::Sha512, sha512);
    }
    for mirror in &args.mirrors {
        request = request.with_mirror(mirror);
    }
    for header in &args.headers {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| anyhow!("header '{header}' must look like NAME:VALUE"))?;
        request = request.with_header(name.trim(), value.trim());
    }
    if args.no_retry {
        request = request.without_retry();
    }

    let scope = match open_scope(config, &args.scope) {
        Ok(scope) => scope,
        Err(err) => return Ok(ExecutionOutcome::failure(&err)),
    };
    match scope.get_file_by_url(&request).await {
        Ok(blob) => Ok(ExecutionOutcome::ok(
            blob.path.display().to_string(),
            blob_details(&blob),
        )),
        Err(err) => Ok(ExecutionOutcome::failure(&err)),
    }
}

fn parse_pairs(pairs: &[String], what: &str) -> Result<Vec<(String, Value)>> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("{what} '{pair}' must look like K=V"))?;
            if key.is_empty() {
                bail!("{what} '{pair}' has an empty name");
            }
            Ok((key.to_string(), Value::String(value.to_string())))
        })
        .collect()
}

async fn dynamic_store(config: &FastpullConfig, args: &DynamicStoreArgs) -> Result<ExecutionOutcome> {
    let key: DynamicKey = parse_pairs(&args.key, "key")?.into_iter().collect();
    let metadata: Metadata = parse_pairs(&args.meta, "metadata")?.into_iter().collect();
    if !args.path.is_file() {
        return Ok(ExecutionOutcome::user_error(
            format!("{} is not a file", args.path.display()),
            json!({ "path": args.path }),
        ));
    }
    let scope = match open_scope(config, &args.scope) {
        Ok(scope) => scope,
        Err(err) => return Ok(ExecutionOutcome::failure(&err)),
    };
    let stored = match &args.name {
        Some(name) => {
            scope
                .store_file_dynamic_by_name(name, &key, &args.path, metadata)
                .await
        }
        None => scope.store_file_dynamic(&key, &args.path, metadata).await,
    };
    match stored {
        Ok(blob) => Ok(ExecutionOutcome::ok(
            blob.path.display().to_string(),
            blob_details(&blob),
        )),
        Err(err) => Ok(ExecutionOutcome::failure(&err)),
    }
}

async fn dynamic_get(config: &FastpullConfig, args: &DynamicGetArgs) -> Result<ExecutionOutcome> {
    let key: DynamicKey = parse_pairs(&args.key, "key")?.into_iter().collect();
    let scope = match open_scope(config, &args.scope) {
        Ok(scope) => scope,
        Err(err) => return Ok(ExecutionOutcome::failure(&err)),
    };
    let found = match &args.name {
        Some(name) => scope.find_dynamic_by_name(name, &key).await,
        None => scope.get_file_dynamic(&key).await,
    };
    match found {
        Ok((Some(blob), metadata)) => {
            let mut details = blob_details(&blob);
            details["metadata"] = Value::Object(metadata.unwrap_or_default());
            Ok(ExecutionOutcome::ok(blob.path.display().to_string(), details))
        }
        Ok((None, _)) => Ok(ExecutionOutcome::user_error(
            "no file stored for key",
            json!({ "key": key }),
        )),
        Err(err) => Ok(ExecutionOutcome::failure(&err)),
    }
}

fn blob(config: &FastpullConfig, command: &BlobCommand) -> Result<ExecutionOutcome> {
    let store = BlobStore::open(config.blos_path(), &config.hashes)
        .with_context(|| format!("failed to open blob store at {}", config.blos_path().display()))?;
    let outcome = match command {
        BlobCommand::Insert { path } => match store.insert_blob(path) {
            Ok(blob) => ExecutionOutcome::ok(blob.sha512(), blob_details(&blob)),
            Err(err) => store_failure(&err),
        },
        BlobCommand::Show { sha512 } => match store.read(&BlobQuery::sha512(sha512.to_ascii_lowercase())) {
            Ok(Some(blob)) => ExecutionOutcome::ok(blob.path.display().to_string(), blob_details(&blob)),
            Ok(None) => ExecutionOutcome::user_error(
                format!("blob {sha512} not found"),
                json!({ "sha512": sha512 }),
            ),
            Err(err) => store_failure(&err),
        },
        BlobCommand::Verify { sha512 } => match store.verify(&sha512.to_ascii_lowercase()) {
            Ok(blob) => ExecutionOutcome::ok(format!("blob {} verified", blob.sha512()), blob_details(&blob)),
            Err(err @ StoreError::MissingBlob { .. }) => {
                ExecutionOutcome::user_error(err.to_string(), json!({ "code": err.code() }))
            }
            Err(err) => store_failure(&err),
        },
        BlobCommand::Stats => {
            let usage = store.usage()?;
            ExecutionOutcome::ok(
                format!("{} blobs, {} bytes", usage.blobs, usage.total_bytes),
                json!({
                    "root": store.root(),
                    "blobs": usage.blobs,
                    "total_bytes": usage.total_bytes,
                    "hashes": store.algorithms(),
                }),
            )
        }
    };
    Ok(outcome)
}

fn store_failure(err: &StoreError) -> ExecutionOutcome {
    ExecutionOutcome::failure(&Error::Store(err.clone()))
}

async fn verify(args: &VerifyArgs) -> Result<ExecutionOutcome> {
    let filename = match &args.name {
        Some(name) => name.clone(),
        None => file_name(&args.path)?,
    };
    let location = args.path.display().to_string();
    match Verifier.check_file(&args.path, &filename, &location).await {
        Ok(Some(kind)) => Ok(ExecutionOutcome::ok(
            format!("{location}: {kind} archive ok"),
            json!({ "path": args.path, "archive": kind, "checked": true }),
        )),
        Ok(None) => Ok(ExecutionOutcome::ok(
            format!("{location}: not a recognized archive; not checked"),
            json!({ "path": args.path, "archive": Value::Null, "checked": false }),
        )),
        Err(err) => Ok(ExecutionOutcome::failure(&Error::Integrity(err))),
    }
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))
}
