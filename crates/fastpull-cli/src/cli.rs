use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

pub const FASTPULL_BEFORE_HELP: &str = concat!(
    "fastpull ",
    env!("CARGO_PKG_VERSION"),
    " – content-addressed fetch and integrity cache\n\n",
    "  fetch            Download a URL once per scope; later calls reuse the blob.\n",
    "  dynamic          Store or look up files under structured keys.\n",
    "  blob             Inspect the shared blob store.\n",
    "  verify           Run the archive listing check on a local file.\n",
);

#[derive(Parser, Debug)]
#[command(
    name = "fastpull",
    author,
    version,
    disable_help_subcommand = true,
    before_help = FASTPULL_BEFORE_HELP
)]
pub struct FastpullCli {
    #[arg(short, long, action = ArgAction::Count, global = true, help = "Increase logging (-vv reaches trace)")]
    pub verbose: u8,
    #[arg(long, global = true, help = "Force trace logging regardless of -v")]
    pub trace: bool,
    #[arg(long, global = true, help = "Emit {status,message,details} JSON envelopes")]
    pub json: bool,
    #[arg(
        long,
        global = true,
        value_name = "DIR",
        help = "Cache root (overrides FASTPULL_PATH)"
    )]
    pub base_path: Option<PathBuf>,
    #[command(subcommand)]
    pub command: CommandGroupCli,
}

#[derive(Subcommand, Debug)]
pub enum CommandGroupCli {
    #[command(about = "Fetch a URL through a scope and print the stored blob")]
    Fetch(FetchArgs),
    #[command(subcommand, about = "Store or look up files under structured keys")]
    Dynamic(DynamicCommand),
    #[command(subcommand, about = "Inspect the blob store")]
    Blob(BlobCommand),
    #[command(about = "Check that a local archive lists cleanly")]
    Verify(VerifyArgs),
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    pub url: String,
    #[arg(long, default_value = "default", help = "Scope whose URL index is consulted")]
    pub scope: String,
    #[arg(long, value_name = "FILE", help = "Local filename (controls archive checks)")]
    pub name: Option<String>,
    #[arg(long, value_name = "HEX", help = "Fail unless the download has this sha512")]
    pub sha512: Option<String>,
    #[arg(long = "mirror", value_name = "URL", help = "Fallback URL, tried in order")]
    pub mirrors: Vec<String>,
    #[arg(long = "header", value_name = "NAME:VALUE", help = "Extra request header")]
    pub headers: Vec<String>,
    #[arg(long, help = "Make a single attempt per source")]
    pub no_retry: bool,
}

#[derive(Subcommand, Debug)]
pub enum DynamicCommand {
    #[command(about = "Insert a file and map a key to it")]
    Store(DynamicStoreArgs),
    #[command(about = "Print the blob mapped to a key (exit 1 on miss)")]
    Get(DynamicGetArgs),
}

#[derive(Args, Debug)]
pub struct DynamicStoreArgs {
    #[arg(long, default_value = "default")]
    pub scope: String,
    #[arg(long = "key", value_name = "K=V", required = true, help = "Key field; repeatable")]
    pub key: Vec<String>,
    #[arg(long, value_name = "PATH")]
    pub path: PathBuf,
    #[arg(long = "meta", value_name = "K=V", help = "Metadata field; repeatable")]
    pub meta: Vec<String>,
    #[arg(long, value_name = "FILE", help = "Fold a final filename into the key")]
    pub name: Option<String>,
}

#[derive(Args, Debug)]
pub struct DynamicGetArgs {
    #[arg(long, default_value = "default")]
    pub scope: String,
    #[arg(long = "key", value_name = "K=V", required = true, help = "Key field; repeatable")]
    pub key: Vec<String>,
    #[arg(long, value_name = "FILE", help = "Fold a final filename into the key")]
    pub name: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum BlobCommand {
    #[command(about = "Copy a file into the blob store")]
    Insert { path: PathBuf },
    #[command(about = "Show a blob's digests and location")]
    Show { sha512: String },
    #[command(about = "Re-hash a blob and compare with its name")]
    Verify { sha512: String },
    #[command(about = "Count blobs and bytes")]
    Stats,
}

#[derive(Args, Debug)]
pub struct VerifyArgs {
    pub path: PathBuf,
    #[arg(long, value_name = "FILE", help = "Filename to classify instead of PATH")]
    pub name: Option<String>,
}
