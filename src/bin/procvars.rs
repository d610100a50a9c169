use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

use procvars::access::{DirectAccessor, MappedAccessor, MemoryAccess};
use procvars::layout::{self, FieldDescriptor};
use procvars::procmaps::{self, AddressTranslation, Pidof, ProcessImageLocation};
use procvars::symbols::{self, SymbolTable};
use procvars::{sections, value, TypeDb};

/// Inspect and modify the globals of a running process using its binary's
/// debug info.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// More logging; repeat for more. RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Flattened fields of every structured variable.
    Fields(Static),
    /// Typedefs of structures and their direct members.
    Typedefs(Static),
    /// Global data objects in .data and .bss.
    Globals(Static),
    /// Ranges of .data and .bss covering the globals.
    Sections(Static),
    /// Where the binary sits in the running process.
    Locate(Target),
    /// Read a variable or field path from the running process.
    Read {
        #[command(flatten)]
        live: Live,
        /// Variable name or dotted field path, e.g. `config.limits.max`.
        path: String,
    },
    /// Write an integer to a variable or field in the running process.
    Write {
        #[command(flatten)]
        live: Live,
        path: String,
        /// Decimal, or hex/octal/binary with a 0x/0o/0b prefix.
        value: String,
    },
    /// Dump raw bytes at a live address.
    Peek {
        #[command(flatten)]
        target: Target,
        #[arg(long, value_enum, default_value_t = Mode::Direct)]
        mode: Mode,
        #[arg(value_parser = parse_int::parse::<u64>)]
        addr: u64,
        #[arg(value_parser = parse_int::parse::<usize>)]
        len: usize,
    },
    /// Store raw bytes at a live address.
    Poke {
        #[command(flatten)]
        target: Target,
        #[arg(long, value_enum, default_value_t = Mode::Direct)]
        mode: Mode,
        #[arg(value_parser = parse_int::parse::<u64>)]
        addr: u64,
        #[arg(required = true, value_parser = parse_int::parse::<u8>)]
        bytes: Vec<u8>,
    },
}

#[derive(Debug, clap::Args)]
struct Static {
    /// ELF binary to analyze.
    #[arg(short = 'f', long = "file")]
    file: PathBuf,
    /// Only show entries whose name matches this regex.
    #[arg(long)]
    filter: Option<regex::Regex>,
}

#[derive(Debug, clap::Args)]
struct Target {
    /// Name of the running binary, as `pidof` and the memory map know it.
    #[arg(short = 'b', long = "binary")]
    binary: String,
    /// Use this process instead of asking `pidof`.
    #[arg(long)]
    pid: Option<u32>,
}

#[derive(Debug, clap::Args)]
struct Live {
    #[arg(short = 'f', long = "file")]
    file: PathBuf,
    /// Defaults to the file name of the ELF binary.
    #[arg(short = 'b', long = "binary")]
    binary: Option<String>,
    #[arg(long)]
    pid: Option<u32>,
    #[arg(long, value_enum, default_value_t = Mode::Direct)]
    mode: Mode,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Mode {
    /// Shared mapping of /proc/<pid>/mem.
    Mmap,
    /// process_vm_readv / process_vm_writev.
    Direct,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Cmd::Fields(s) => cmd_fields(&s),
        Cmd::Typedefs(s) => cmd_typedefs(&s),
        Cmd::Globals(s) => cmd_globals(&s),
        Cmd::Sections(s) => cmd_sections(&s),
        Cmd::Locate(t) => cmd_locate(&t),
        Cmd::Read { live, path } => cmd_read(&live, &path),
        Cmd::Write { live, path, value } => cmd_write(&live, &path, &value),
        Cmd::Peek { target, mode, addr, len } => {
            let location = locate(&target.binary, target.pid)?;
            let mut mem = accessor(mode, &location)?;
            let bytes = mem.read(addr, len)?;
            println!("{:#x}: {}", addr, value::Value::Bytes(bytes));
            Ok(())
        }
        Cmd::Poke { target, mode, addr, bytes } => {
            let location = locate(&target.binary, target.pid)?;
            let mut mem = accessor(mode, &location)?;
            mem.write(addr, &bytes)?;
            println!("wrote {} bytes at {:#x}", bytes.len(), addr);
            Ok(())
        }
    }
}

fn init_logging(verbose: u8) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::EnvFilter::from_default_env()
    } else {
        tracing_subscriber::EnvFilter::new(match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        })
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// The ELF file, kept around because `object::File` borrows from it.
struct Binary {
    buffer: Vec<u8>,
}

impl Binary {
    fn load(path: &Path) -> Result<Self> {
        let buffer = std::fs::read(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(Self { buffer })
    }

    fn object(&self) -> Result<object::File<'_>> {
        Ok(object::File::parse(&*self.buffer)?)
    }
}

fn load_db(object: &object::File) -> Result<TypeDb> {
    procvars::parse_file(object).context("loading debug info")
}

fn matches(filter: &Option<regex::Regex>, name: &str) -> bool {
    filter.as_ref().map_or(true, |re| re.is_match(name))
}

fn heading(text: &str) {
    println!("{}", ansi_term::Style::new().bold().paint(text));
}

fn cmd_fields(args: &Static) -> Result<()> {
    let bin = Binary::load(&args.file)?;
    let db = load_db(&bin.object()?)?;
    let fields = layout::struct_fields(&db)?;

    heading(&format!("{:<48} {:>8} {:>6}  {}", "PATH", "OFFSET", "SIZE", "TYPE"));
    for fd in fields.values().filter(|fd| matches(&args.filter, &fd.path)) {
        println!(
            "{:<48} {:>#8x} {:>6}  {}",
            fd.path,
            fd.offset,
            fd.size,
            db.type_name(fd.type_id).unwrap_or_default(),
        );
    }
    Ok(())
}

fn cmd_typedefs(args: &Static) -> Result<()> {
    let bin = Binary::load(&args.file)?;
    let db = load_db(&bin.object()?)?;
    let dim = ansi_term::Style::new().dimmed();

    for (name, &id) in layout::structure_typedefs(&db)
        .iter()
        .filter(|(name, _)| matches(&args.filter, name))
    {
        let size = db
            .type_by_id(id)
            .and_then(|t| t.byte_size(&db))
            .unwrap_or(0);
        heading(&format!("{} ({} bytes)", name, size));
        for m in layout::typedef_members(&db, id)? {
            println!(
                "    {:<32} {} {}",
                m.name,
                dim.paint(format!("+{:#x}/{}", m.offset, m.size)),
                m.type_name
            );
        }
    }
    Ok(())
}

fn cmd_globals(args: &Static) -> Result<()> {
    let bin = Binary::load(&args.file)?;
    let table = SymbolTable::from_object(&bin.object()?)?;
    let globals = symbols::extract_globals(&table);

    heading(&format!(
        "{:<40} {:>18} {:>8} {:<7} {:>10}",
        "NAME", "ADDRESS", "SIZE", "SECTION", "OFFSET"
    ));
    for g in globals.values().filter(|g| matches(&args.filter, &g.name)) {
        println!(
            "{:<40} {:>#18x} {:>8} {:<7} {:>#10x}",
            g.name,
            g.address,
            g.size,
            g.section_name,
            g.section_offset()
        );
    }
    Ok(())
}

fn cmd_sections(args: &Static) -> Result<()> {
    let bin = Binary::load(&args.file)?;
    let table = SymbolTable::from_object(&bin.object()?)?;
    let globals = symbols::extract_globals(&table);
    let ranges = sections::required_sections(&globals);

    heading(&format!(
        "{:<8} {:>18} {:>10} {:>10} {:>8}",
        "SECTION", "BASE", "START", "END", "SIZE"
    ));
    for r in ranges.values().filter(|r| matches(&args.filter, &r.section_name)) {
        println!(
            "{:<8} {:>#18x} {:>#10x} {:>#10x} {:>8}",
            r.section_name,
            r.base_address(),
            r.data_start_offset,
            r.data_end_offset,
            r.size()
        );
    }
    Ok(())
}

fn locate(binary: &str, pid: Option<u32>) -> Result<ProcessImageLocation> {
    let location = match pid {
        Some(pid) => procmaps::locate_pid(pid, binary)?,
        None => procmaps::locate(binary, &Pidof)?,
    };
    Ok(location)
}

fn cmd_locate(args: &Target) -> Result<()> {
    let l = locate(&args.binary, args.pid)?;
    println!("pid:            {}", l.process_id);
    println!("load base:      {:#x}", l.load_base);
    println!(
        "writable:       {:#x}..{:#x} ({} bytes)",
        l.writable_region_start,
        l.writable_region_end,
        l.writable_len()
    );
    Ok(())
}

fn accessor(
    mode: Mode,
    location: &ProcessImageLocation,
) -> Result<Box<dyn MemoryAccess>> {
    Ok(match mode {
        Mode::Mmap => Box::new(MappedAccessor::open(location)?),
        Mode::Direct => Box::new(DirectAccessor::new(location)?),
    })
}

/// Everything a live read or write needs, resolved from the command line.
struct Session {
    db: TypeDb,
    translation: AddressTranslation,
    location: ProcessImageLocation,
    mem: Box<dyn MemoryAccess>,
}

impl Session {
    fn open(live: &Live) -> Result<Self> {
        let bin = Binary::load(&live.file)?;
        let object = bin.object()?;
        let db = load_db(&object)?;
        let translation = AddressTranslation::for_object(&object);

        let binary = match &live.binary {
            Some(b) => b.clone(),
            None => live
                .file
                .file_name()
                .and_then(|n| n.to_str())
                .context("binary name is not valid UTF-8; pass --binary")?
                .to_string(),
        };
        let location = locate(&binary, live.pid)?;
        let mem = accessor(live.mode, &location)?;
        Ok(Self {
            db,
            translation,
            location,
            mem,
        })
    }

    /// Finds the leaves at or under `path`, with their static base address.
    fn resolve(&self, path: &str) -> Result<(u64, Vec<FieldDescriptor>)> {
        let var_name = path.split('.').next().unwrap_or(path);
        let Some((addr, type_id, name)) = self
            .db
            .variables_by_name(var_name)
            .find_map(|(_, v)| Some((v.location?, v.type_id?, v.name.as_str())))
        else {
            bail!("no variable named {:?} with a known address and type", var_name);
        };
        let prefix = format!("{}.", path);
        let leaves: Vec<_> = layout::flatten(&self.db, type_id, name)?
            .into_iter()
            .filter(|fd| fd.path == path || fd.path.starts_with(&prefix))
            .collect();
        if leaves.is_empty() {
            bail!("{} has no field {:?}", name, path);
        }
        Ok((addr, leaves))
    }

    fn live_address(&self, base: u64, fd: &FieldDescriptor) -> u64 {
        self.location.live_address(base + fd.offset, self.translation)
    }
}

fn cmd_read(live: &Live, path: &str) -> Result<()> {
    let mut s = Session::open(live)?;
    let (base, leaves) = s.resolve(path)?;
    for fd in &leaves {
        let addr = s.live_address(base, fd);
        let bytes = s
            .mem
            .read(addr, fd.size as usize)
            .with_context(|| format!("reading {} at {:#x}", fd.path, addr))?;
        let v = value::decode(&s.db, fd.type_id, &bytes)?;
        println!("{} = {}", fd.path, v);
    }
    Ok(())
}

fn cmd_write(live: &Live, path: &str, text: &str) -> Result<()> {
    let n = parse_int::parse::<i64>(text)
        .map(i128::from)
        .or_else(|_| parse_int::parse::<u64>(text).map(i128::from))
        .with_context(|| format!("{:?} is not an integer", text))?;

    let mut s = Session::open(live)?;
    let (base, leaves) = s.resolve(path)?;
    let [fd] = &leaves[..] else {
        bail!("{} is a structure; write one of its fields instead", path);
    };
    let bytes = value::encode_integer(&s.db, fd.type_id, n)?;
    let addr = s.live_address(base, fd);
    s.mem
        .write(addr, &bytes)
        .with_context(|| format!("writing {} at {:#x}", fd.path, addr))?;

    let v = value::decode(&s.db, fd.type_id, &s.mem.read(addr, bytes.len())?)?;
    println!("{} = {}", fd.path, v);
    Ok(())
}
