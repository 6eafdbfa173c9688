use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use clap_num::maybe_hex;
use exhume_body::{Body, BodySlice};
use log::{debug, error};
use ntfs_tree::{FileStat, FileSystem, FsConfig, NtfsVolume, Result, Volume};
use prettytable::{Table, row};
use serde_json::{Value, json};
use std::io::{Read, Seek, Write};

fn main() {
    let matches = Command::new("ntfs_tree")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Walk the MFT and directory tree of an NTFS filesystem.")
        .arg(
            Arg::new("body")
                .short('b')
                .long("body")
                .value_parser(value_parser!(String))
                .required(true)
                .help("The path to the body to exhume."),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_parser(value_parser!(String))
                .required(false)
                .help("The format of the file, either 'raw' or 'ewf'."),
        )
        .arg(
            Arg::new("offset")
                .short('o')
                .long("offset")
                .value_parser(maybe_hex::<u64>)
                .required(true)
                .help("The NTFS partition starts at address (decimal or hex)."),
        )
        .arg(
            Arg::new("size")
                .short('s')
                .long("size")
                .value_parser(maybe_hex::<u64>)
                .required(true)
                .help("The size of the NTFS partition in sectors (decimal or hex)."),
        )
        .arg(
            Arg::new("pbs")
                .long("pbs")
                .action(ArgAction::SetTrue)
                .help("Display the partition boot sector information."),
        )
        .arg(
            Arg::new("mft")
                .long("mft")
                .action(ArgAction::SetTrue)
                .help("Display the high level master file table information."),
        )
        .arg(
            Arg::new("file_id")
                .long("file")
                .value_parser(maybe_hex::<u64>)
                .help("Display the metadata of an MFT record number."),
        )
        .arg(
            Arg::new("ls")
                .long("ls")
                .value_parser(value_parser!(String))
                .help("List the directory at this path."),
        )
        .arg(
            Arg::new("stat")
                .long("stat")
                .value_parser(value_parser!(String))
                .help("Display the directory entry of this path."),
        )
        .arg(
            Arg::new("cat")
                .long("cat")
                .value_parser(value_parser!(String))
                .help("Write the unnamed data stream of this path to stdout."),
        )
        .arg(
            Arg::new("cache_size")
                .long("cache-size")
                .value_parser(value_parser!(usize))
                .default_value("50")
                .help("Directory indexes kept in the path cache."),
        )
        .arg(
            Arg::new("json")
                .short('j')
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Output the structures in JSON format."),
        )
        .arg(
            Arg::new("log_level")
                .short('l')
                .long("log-level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("info")
                .help("Set the log verbosity level"),
        )
        .get_matches();

    let level_filter = match matches.get_one::<String>("log_level").map(String::as_str) {
        Some("error") => log::LevelFilter::Error,
        Some("warn") => log::LevelFilter::Warn,
        Some("debug") => log::LevelFilter::Debug,
        Some("trace") => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    };
    env_logger::Builder::new().filter_level(level_filter).init();

    let (Some(file_path), Some(offset), Some(size)) = (
        matches.get_one::<String>("body"),
        matches.get_one::<u64>("offset"),
        matches.get_one::<u64>("size"),
    ) else {
        error!("--body, --offset and --size are required");
        std::process::exit(2);
    };
    let auto = String::from("auto");
    let format = matches.get_one::<String>("format").unwrap_or(&auto);

    let mut body = Body::new(file_path.to_owned(), format);
    debug!("Created Body from '{}'", file_path);

    let partition_size = *size * body.get_sector_size() as u64;
    let mut slice = match BodySlice::new(&mut body, *offset, partition_size) {
        Ok(sl) => sl,
        Err(e) => {
            error!("Could not create BodySlice: {}", e);
            std::process::exit(1);
        }
    };

    let volume = match NtfsVolume::new(&mut slice) {
        Ok(vol) => vol,
        Err(e) => {
            error!("Couldn't open NTFS: {}", e);
            std::process::exit(1);
        }
    };
    let config = FsConfig {
        index_cache_size: matches.get_one::<usize>("cache_size").copied().unwrap_or(50),
        ..FsConfig::default()
    };
    let mut fs = match FileSystem::with_config(volume, config) {
        Ok(fs) => fs,
        Err(e) => {
            error!("Couldn't load the root directory: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&mut fs, &matches) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run<T: Read + Seek>(fs: &mut FileSystem<NtfsVolume<T>>, matches: &ArgMatches) -> Result<()> {
    let json_output = matches.get_flag("json");

    if matches.get_flag("pbs") {
        let pbs = &fs.volume().pbs;
        if json_output {
            print_json(&pbs.to_json());
        } else {
            println!("{}", pbs);
        }
    }

    if matches.get_flag("mft") {
        print_mft(fs.volume(), json_output)?;
    }

    if let Some(id) = matches.get_one::<u64>("file_id") {
        let vol = fs.volume();
        let mut entry = vol.mft_entry(*id)?;
        if json_output {
            print_json(&entry.to_json(vol)?);
        } else {
            println!("{}", entry.to_table(vol)?);
        }
    }

    if let Some(path) = matches.get_one::<String>("ls") {
        let names = fs.dir_entries(path)?;
        let base = path.trim_end_matches(['/', '\\']);
        let mut stats = Vec::with_capacity(names.len());
        for name in &names {
            match fs.stat(&format!("{}/{}", base, name)) {
                Ok(st) => stats.push(st),
                Err(e) => debug!("no stat for {}: {}", name, e),
            }
        }
        if json_output {
            print_json(&json!({ "path": path, "entries": stats }));
        } else {
            for st in &stats {
                let kind = if st.directory { "d" } else { "-" };
                println!("{} {:>8} {:>12}  {}", kind, st.record, st.size, st.name);
            }
        }
    }

    if let Some(path) = matches.get_one::<String>("stat") {
        let st = fs.stat(path)?;
        if json_output {
            print_json(&json!(st));
        } else {
            println!("{}", stat_table(&st));
        }
    }

    if let Some(path) = matches.get_one::<String>("cat") {
        let data = fs.read_file(path)?;
        std::io::stdout().write_all(&data)?;
    }

    debug!("path cache hits: {}", fs.cache_hits());
    Ok(())
}

fn print_mft<T: Read + Seek>(vol: &mut NtfsVolume<T>, json_output: bool) -> Result<()> {
    let name = vol.volume_name()?.map(|n| n.name).unwrap_or_default();
    let version = vol.version().map(|v| v.to_string()).unwrap_or_else(|| "unknown".into());
    if json_output {
        print_json(&json!({
            "volume_name": name,
            "version": version,
            "records": vol.mft_records_count(),
            "record_size": vol.bytes_per_file_record(),
            "runs": vol.mft_runs(),
        }));
        return Ok(());
    }

    let mut t = Table::new();
    t.add_row(row![b -> "Volume name", name]);
    t.add_row(row![b -> "NTFS version", version]);
    t.add_row(row![b -> "MFT records", vol.mft_records_count()]);
    t.add_row(row![b -> "Record size", vol.bytes_per_file_record()]);
    for (i, run) in vol.mft_runs().iter().enumerate() {
        let lcn = run.lcn.map(|l| l.to_string()).unwrap_or_else(|| "sparse".into());
        t.add_row(row![b -> format!("Run {}", i), format!("LCN {} x {} clusters", lcn, run.length)]);
    }
    println!("{}", t);
    Ok(())
}

fn stat_table(st: &FileStat) -> Table {
    let time = |t: Option<chrono::DateTime<chrono::Utc>>| t.map(|t| t.to_rfc3339()).unwrap_or_default();
    let mut t = Table::new();
    t.add_row(row![b -> "Name", st.name]);
    t.add_row(row![b -> "MFT record", st.record]);
    t.add_row(row![b -> "Directory", st.directory]);
    t.add_row(row![b -> "Size", st.size]);
    t.add_row(row![b -> "Allocated", st.allocated]);
    t.add_row(row![b -> "Links", st.links]);
    t.add_row(row![b -> "Created", time(st.ctime)]);
    t.add_row(row![b -> "Modified", time(st.mtime)]);
    t.add_row(row![b -> "Accessed", time(st.atime)]);
    t
}

fn print_json(v: &Value) {
    match serde_json::to_string_pretty(v) {
        Ok(s) => println!("{}", s),
        Err(e) => error!("Error serializing to JSON: {}", e),
    }
}
