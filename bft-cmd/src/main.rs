use std::{
    fs,
    io::{self, Read},
    path::PathBuf,
};

use anyhow::Context;
use bft::{forth, lift, Engine, Flags, Image, Tape};
use clap::Parser;
use log::{info, Level};

#[derive(Debug, clap::Parser)]
#[command(author, version, about)]
struct Command {
    #[command(subcommand)]
    subcommand: SubCommand,
    #[arg(long, default_value_t = Level::Warn)]
    log_level: Level,
}

#[derive(Debug, clap::Subcommand)]
enum SubCommand {
    /// Compile Brainfuck source into a JSON instruction stream.
    Compile(CompileArg),
    /// Compile Brainforth source into a JSON procedure image.
    Forth(CompileArg),
    /// Execute JSON instruction streams, one file after another.
    Run(RunArg),
}

#[derive(Debug, clap::Parser)]
struct CompileArg {
    /// Source file; standard input when omitted.
    file: Option<PathBuf>,
    #[command(flatten)]
    toggles: FlagToggles,
}

#[derive(Debug, clap::Args)]
struct FlagToggles {
    /// Enable every optimisation.
    #[arg(long, conflicts_with = "none")]
    all: bool,
    /// Disable every optimisation.
    #[arg(long)]
    none: bool,
    /// Skip loops whose guard cell is provably zero.
    #[arg(long)]
    deadcode: bool,
    #[arg(long, conflicts_with = "deadcode")]
    no_deadcode: bool,
    /// Lift `[>]` and `[<]` into seek instructions.
    #[arg(long)]
    seekzero: bool,
    #[arg(long, conflicts_with = "seekzero")]
    no_seekzero: bool,
    /// Lift `[+]` and `[-]` into SET_ZERO.
    #[arg(long)]
    prune_if_loc_is_zero: bool,
    #[arg(long, conflicts_with = "prune_if_loc_is_zero")]
    no_prune_if_loc_is_zero: bool,
    /// Lift balanced transfer loops into XFR_MULTIPLE.
    #[arg(long)]
    xfrmultiple: bool,
    #[arg(long, conflicts_with = "xfrmultiple")]
    no_xfrmultiple: bool,
    /// Unplant stores discarded by a following SET_ZERO.
    #[arg(long)]
    superfluous: bool,
    #[arg(long, conflicts_with = "superfluous")]
    no_superfluous: bool,
}

impl FlagToggles {
    fn resolve(&self) -> Flags {
        fn toggle(on: bool, off: bool, base: bool) -> bool {
            if on {
                true
            } else if off {
                false
            } else {
                base
            }
        }
        let mut flags = if self.all { Flags::all() } else { Flags::none() };
        flags.dead_code = toggle(self.deadcode, self.no_deadcode, flags.dead_code);
        flags.seek_zero = toggle(self.seekzero, self.no_seekzero, flags.seek_zero);
        flags.prune_if_loc_is_zero = toggle(
            self.prune_if_loc_is_zero,
            self.no_prune_if_loc_is_zero,
            flags.prune_if_loc_is_zero,
        );
        flags.xfr_multiple = toggle(self.xfrmultiple, self.no_xfrmultiple, flags.xfr_multiple);
        flags.superfluous = toggle(self.superfluous, self.no_superfluous, flags.superfluous);
        flags
    }
}

#[derive(Debug, clap::Parser)]
struct RunArg {
    /// Instruction image files, executed in order against shared stdin.
    #[arg(required = true)]
    files: Vec<PathBuf>,
    #[arg(long, default_value_t = 30000)]
    memory_len: usize,
}

fn main() -> anyhow::Result<()> {
    let arg = Command::parse();

    env_logger::builder()
        .filter_level(arg.log_level.to_level_filter())
        .init();

    match arg.subcommand {
        SubCommand::Compile(arg) => {
            let code = read_source(arg.file)?;
            let program = lift(&code, arg.toggles.resolve())?;
            println!("{}", serde_json::to_string_pretty(&program)?);
        }
        SubCommand::Forth(arg) => {
            let code = read_source(arg.file)?;
            let bindings = forth::compile(&code, arg.toggles.resolve())?;
            println!("{}", serde_json::to_string_pretty(&bindings)?);
        }
        SubCommand::Run(arg) => {
            let header_needed = arg.files.len() > 1;
            for file in &arg.files {
                if header_needed {
                    eprintln!("# Executing: {}", file.display());
                }
                let json = fs::read_to_string(file)
                    .with_context(|| format!("reading {}", file.display()))?;
                let image = Image::from_json(&json)?;
                let steps = Engine::builder()
                    .image(&image)
                    .input(io::stdin())
                    .output(io::stdout())
                    .tape(Tape::growable(arg.memory_len))
                    .build()
                    .run()?;
                info!("steps: {steps}");
            }
        }
    }
    Ok(())
}

fn read_source(file: Option<PathBuf>) -> anyhow::Result<String> {
    match file {
        Some(path) => {
            fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
        }
        None => {
            let mut code = String::new();
            io::stdin().read_to_string(&mut code)?;
            Ok(code)
        }
    }
}
