pub mod handlers;

use crate::presentation::cli::{Cli, Commands};
use bitarchive_monitor::Result;
use clap::Parser;

pub fn run() -> Result<()> {
    let Cli {
        settings,
        dirs,
        command,
    } = Cli::parse();
    let open = || handlers::open_store(settings.as_deref(), &dirs);
    match command {
        Commands::Pack { out, inputs, zstd } => handlers::handle_pack(out, inputs, zstd),
        Commands::Records { file } => handlers::handle_records(file),
        Commands::Upload { src, name } => handlers::handle_upload(&open()?, src, name),
        Commands::Get {
            filename,
            offset,
            out,
        } => handlers::handle_get(&open()?, filename, offset, out),
        Commands::GetFile { filename } => handlers::handle_get_file(&open()?, filename),
        Commands::List { filter, report } => handlers::handle_list(&open()?, filter, report),
        Commands::Batch {
            job,
            filter,
            app_id,
        } => handlers::handle_batch(&open()?, job, filter, app_id),
        Commands::Remove { filename, checksum } => {
            handlers::handle_remove(&open()?, filename, checksum)
        }
        Commands::Reconcile => handlers::handle_reconcile(&open()?),
        Commands::ReplicaBatch {
            cluster,
            replica,
            job,
            filter,
        } => handlers::handle_replica_batch(cluster, replica, job, filter),
    }
}
