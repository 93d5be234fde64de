use clap::Parser;
use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

/// Thin client for the controlfreak admin protocol: send one command line,
/// print the response lines, exit nonzero on `ERROR:`.
#[derive(Debug, Parser)]
#[command(name = "cfkctl", version, about = "controlfreak control client")]
struct Args {
    /// Admin endpoint: a unix socket path or host:port
    #[arg(short = 's', long = "sock")]
    sock: Option<String>,

    /// The admin command; reads commands from stdin when omitted
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

struct MissingSockHelp;

impl fmt::Display for MissingSockHelp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "no controlfreak endpoint specified")?;
        writeln!(f)?;
        writeln!(f, "Provide the admin endpoint via one of:")?;
        writeln!(f, "  - cfkctl --sock /path/to/home/sock <command...>")?;
        writeln!(f, "  - cfkctl --sock 127.0.0.1:9001 <command...>")?;
        writeln!(f, "  - export CFKCTL_SOCK=/path/to/home/sock")?;
        writeln!(f)?;
        write!(f, "The default daemon socket is ~/.controlfreak/sock.")
    }
}

fn resolve_sock(args: &Args) -> anyhow::Result<String> {
    if let Some(s) = args.sock.clone() {
        return Ok(s);
    }
    if let Ok(v) = std::env::var("CFKCTL_SOCK") {
        let t = v.trim();
        if !t.is_empty() {
            return Ok(t.to_string());
        }
    }
    let default = std::env::var_os("HOME")
        .map(PathBuf::from)
        .map(|h| h.join(".controlfreak").join("sock"));
    if let Some(p) = default {
        if p.exists() {
            return Ok(p.display().to_string());
        }
    }
    anyhow::bail!("{}", MissingSockHelp)
}

enum Conn {
    Unix(std::os::unix::net::UnixStream),
    Tcp(std::net::TcpStream),
}

impl Conn {
    fn connect(spec: &str) -> anyhow::Result<Conn> {
        if spec.contains('/') {
            let s = std::os::unix::net::UnixStream::connect(spec)
                .map_err(|e| anyhow::anyhow!("connect to {spec}: {e}"))?;
            Ok(Conn::Unix(s))
        } else {
            let s = std::net::TcpStream::connect(spec)
                .map_err(|e| anyhow::anyhow!("connect to {spec}: {e}"))?;
            Ok(Conn::Tcp(s))
        }
    }

    fn split(&self) -> anyhow::Result<(Box<dyn BufRead>, Box<dyn Write>)> {
        match self {
            Conn::Unix(s) => Ok((
                Box::new(BufReader::new(s.try_clone()?)),
                Box::new(s.try_clone()?),
            )),
            Conn::Tcp(s) => Ok((
                Box::new(BufReader::new(s.try_clone()?)),
                Box::new(s.try_clone()?),
            )),
        }
    }
}

/// Returns false when the daemon answered with an error.
fn send_command(
    r: &mut dyn BufRead,
    w: &mut dyn Write,
    line: &str,
) -> anyhow::Result<bool> {
    w.write_all(line.as_bytes())?;
    w.write_all(b"\r\n")?;
    w.flush()?;

    let mut ok = true;
    loop {
        let mut resp = String::new();
        let n = r.read_line(&mut resp)?;
        if n == 0 {
            anyhow::bail!("connection closed before a terminator line");
        }
        let resp = resp.trim_end_matches(['\r', '\n']);
        if resp == "OK" {
            break;
        }
        if let Some(reason) = resp.strip_prefix("ERROR:") {
            eprintln!("ERROR:{reason}");
            ok = false;
            break;
        }
        println!("{resp}");
    }
    Ok(ok)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let sock = resolve_sock(&args)?;
    let conn = Conn::connect(&sock)?;
    let (mut r, mut w) = conn.split()?;

    let mut all_ok = true;
    if args.command.is_empty() {
        // Interactive/piped mode: one admin command per stdin line.
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if !send_command(r.as_mut(), w.as_mut(), &line)? {
                all_ok = false;
            }
        }
    } else {
        let line = args.command.join(" ");
        all_ok = send_command(r.as_mut(), w.as_mut(), &line)?;
    }

    let _ = w.write_all(b"exit\r\n");
    let _ = w.flush();
    if all_ok {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
