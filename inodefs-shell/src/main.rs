mod cli;
mod session;

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};

use clap::Parser;
use inodefs::io::{BlockStorage, FileBlockEmulator, FileBlockEmulatorBuilder};
use inodefs::Volume;
use log::{info, warn};

use self::cli::Cli;
use self::session::{Flow, Session, ShellError};

fn open_volume(cli: &Cli) -> Result<Volume<FileBlockEmulator>, ShellError> {
    let geometry = cli.geometry()?;
    let block_count = geometry.total_blocks() as usize;
    let block_bytes = geometry.block_bytes() as usize;

    let vol = match &cli.image {
        None => {
            info!("no image given, formatting a scratch volume");
            let dev = FileBlockEmulatorBuilder::scratch()?
                .with_block_count(block_count)
                .with_block_bytes(block_bytes)
                .build()?;
            Volume::format(dev, &geometry)?
        }
        Some(path) if cli.format => {
            let fd = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            let dev = FileBlockEmulatorBuilder::from(fd)
                .with_block_count(block_count)
                .with_block_bytes(block_bytes)
                .build()?;
            Volume::format(dev, &geometry)?
        }
        Some(path) => {
            let len = fs::metadata(path)?.len();
            let dev = FileBlockEmulator::open_disk(path, (len / block_bytes as u64) as usize, block_bytes)?;
            Volume::open(dev)?
        }
    };
    Ok(vol)
}

fn main() -> Result<(), ShellError> {
    env_logger::init();
    let cli = Cli::parse();

    let mut session = Session::new(open_volume(&cli)?);
    let interactive = cli.script.is_none();
    let input: Box<dyn BufRead> = match &cli.script {
        Some(script) => Box::new(BufReader::new(File::open(script)?)),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut lines = input.lines();
    loop {
        if interactive {
            write!(out, "inodefs:{}> ", session.pwd()?)?;
            out.flush()?;
        }
        let line = match lines.next() {
            Some(line) => line?,
            None => break,
        };
        match session.execute(&line, &mut out) {
            Ok(Flow::Continue) => (),
            Ok(Flow::Quit) => return Ok(()),
            Err(e) => {
                warn!("{}: {}", line.trim(), e);
                writeln!(out, "{}", e)?;
            }
        }
    }
    session.volume().sync()?;
    Ok(())
}
