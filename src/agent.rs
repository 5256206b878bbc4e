//! Embedded remote agent
//!
//! Each SSH channel runs one copy of this Python program on the remote
//! host. It answers length-prefixed read requests on stdin with
//! length-prefixed responses on stdout, streaming bodies in 256 KiB pieces.
//! Wire layout (big-endian):
//!
//!   request:  u16 path_len | path | u64 offset | u64 length
//!   response: u8 status | u64 data_len | data_len bytes
//!
//! status 0 carries file bytes; the agent may return fewer bytes than
//! requested when the range runs past EOF, and the header's data_len is the
//! actual count. status 1 carries a UTF-8 error message capped at 1000
//! bytes. Clean stdin EOF is a clean exit. Listing and globbing never go
//! through the agent; those are one-shot shell commands.

use crate::ssh::sh_quote;

pub const AGENT_SOURCE: &str = r#"
import os, struct, sys

CHUNK = 262144
VERBOSE = os.environ.get("SSHGET_AGENT_VERBOSE") == "1"

def log(msg):
    if VERBOSE:
        sys.stderr.write("agent: %s\n" % msg)
        sys.stderr.flush()

def read_exact(stream, n):
    buf = b""
    while len(buf) < n:
        piece = stream.read(n - len(buf))
        if not piece:
            return None
        buf += piece
    return buf

def send_error(stdout, exc):
    msg = str(exc).encode("utf-8")[:1000]
    stdout.write(struct.pack(">BQ", 1, len(msg)))
    stdout.write(msg)
    stdout.flush()

def serve(stdin, stdout):
    while True:
        hdr = read_exact(stdin, 2)
        if hdr is None:
            return
        (path_len,) = struct.unpack(">H", hdr)
        rest = read_exact(stdin, path_len + 16)
        if rest is None:
            return
        path = rest[:path_len].decode("utf-8", "surrogateescape")
        offset, length = struct.unpack(">QQ", rest[path_len:])
        try:
            with open(path, "rb") as f:
                f.seek(0, 2)
                size = f.tell()
                start = offset if offset < size else size
                actual = min(length, size - start)
                f.seek(start)
                stdout.write(struct.pack(">BQ", 0, actual))
                stdout.flush()
                left = actual
                while left > 0:
                    data = f.read(CHUNK if CHUNK < left else left)
                    if not data:
                        break
                    stdout.write(data)
                    left -= len(data)
                stdout.flush()
                log("served %s @%d +%d" % (path, start, actual))
        except Exception as exc:
            send_error(stdout, exc)
            log("error %s: %s" % (path, exc))

def main():
    stdin = sys.stdin.buffer
    stdout = sys.stdout.buffer
    try:
        serve(stdin, stdout)
    except Exception as exc:
        try:
            send_error(stdout, exc)
        except Exception:
            pass
        sys.exit(1)

main()
"#;

/// Remote command line for one agent channel. `exec` replaces the login
/// shell so signalling the ssh process group reaches the interpreter.
/// `verbose` turns on the agent's stderr logging, which rides the SSH
/// channel back into the pool's stderr tails.
pub fn bootstrap_command(runtime: &str, verbose: bool) -> String {
    if verbose {
        format!(
            "exec env SSHGET_AGENT_VERBOSE=1 {} -c {}",
            runtime,
            sh_quote(AGENT_SOURCE)
        )
    } else {
        format!("exec {} -c {}", runtime, sh_quote(AGENT_SOURCE))
    }
}

/// One-shot command printing the remote interpreter's major version.
pub fn runtime_probe_command(runtime: &str) -> String {
    format!(
        "{} -c {}",
        runtime,
        sh_quote("import sys; print(sys.version_info[0])")
    )
}
