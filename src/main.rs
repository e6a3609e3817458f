use clap::Parser;
use spyctl::{
    cli::{Args, Command, PolicyLoader, render},
    diff::diff_policies,
    error::SpyctlError,
    merge::merge_policies,
};

fn main() -> Result<(), SpyctlError> {
    env_logger::init();

    let args = Args::parse();

    match args.command {
        Command::Merge {
            files,
            output,
            format,
        } => {
            let policies = PolicyLoader::load_all(&files)?;
            let merged = merge_policies(&policies)?;
            let rendered = render(&merged, format)?;
            match output {
                Some(path) => std::fs::write(path, rendered)?,
                None => print!("{rendered}"),
            }
        }
        Command::Diff {
            original,
            other,
            format,
        } => {
            let original = PolicyLoader::load(&original)?;
            let other = PolicyLoader::load(&other)?;
            let report = diff_policies(&original, &other)?;
            if report.is_empty() {
                println!("no differences");
            } else {
                print!("{}", render(&report, format)?);
            }
        }
        Command::Validate { files } => {
            for file in &files {
                PolicyLoader::load(file)?;
                println!("{}: valid", file.display());
            }
        }
    }

    Ok(())
}
