//! チェックポイント / エクスポート済み重みのメタデータを表示する

use anyhow::Result;
use std::path::PathBuf;
use weed_watcher_lib::model::checkpoint::{is_bundle, load_checkpoint, load_weights};
use weed_watcher_lib::model::print_metadata_info;

fn main() -> Result<()> {
    let paths: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        anyhow::bail!("usage: inspect_checkpoint <model.tar.gz | model.bin>...");
    }

    for path in &paths {
        println!("=== {} ===", path.display());
        if is_bundle(path)? {
            let checkpoint = load_checkpoint(path)?;
            print_metadata_info(&checkpoint.metadata);
            println!("重み: {} bytes", checkpoint.model.len());
            match &checkpoint.optimizer {
                Some(state) => println!("オプティマイザ状態: {} bytes", state.len()),
                None => println!("オプティマイザ状態: なし"),
            }
        } else {
            let (metadata, bytes) = load_weights(path)?;
            print_metadata_info(&metadata);
            println!("重み: {} bytes", bytes.len());
        }
        println!();
    }
    Ok(())
}
