//! Config-to-driver glue: reads a graph file, boots the `Driver`, runs
//! it to completion, and maps the outcome to the exit codes of §6.4.
//! The binary owns argument parsing and logger setup; this module is
//! the part of the "application shell" that the core's driver does not
//! need to know about.

use std::fs;
use std::path::Path;

use config;
use driver::{Driver, Summary};
use error::TgenError;

/// Loads the graph at `path` and runs it to completion.
pub fn run_from_path<P: AsRef<Path>>(path: P) -> Result<Summary, TgenError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .map_err(|e| TgenError::Graph(format!("cannot read graph file '{}': {}", path.display(), e)))?;
    let graph = config::from_str(&text)?;
    let driver = Driver::boot(graph)?;
    driver.run()
}

/// `0` on a clean End-triggered shutdown, `1` on a fatal init failure
/// (bad graph, bind failure), `2` on a runtime poller failure.
pub fn exit_code(result: &Result<Summary, TgenError>) -> i32 {
    match *result {
        Ok(_) => 0,
        Err(TgenError::Poll(_)) => 2,
        Err(_) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn maps_clean_run_to_zero() {
        assert_eq!(exit_code(&Ok(Summary::default())), 0);
    }

    #[test]
    fn maps_graph_error_to_one() {
        let err: Result<Summary, TgenError> = Err(TgenError::Graph("bad".into()));
        assert_eq!(exit_code(&err), 1);
    }

    #[test]
    fn maps_bind_error_to_one() {
        let err: Result<Summary, TgenError> =
            Err(TgenError::Bind(io::Error::new(io::ErrorKind::AddrInUse, "in use")));
        assert_eq!(exit_code(&err), 1);
    }

    #[test]
    fn maps_poll_error_to_two() {
        let err: Result<Summary, TgenError> =
            Err(TgenError::Poll(io::Error::new(io::ErrorKind::Other, "epoll died")));
        assert_eq!(exit_code(&err), 2);
    }

    #[test]
    fn missing_graph_file_is_reported() {
        let result = run_from_path("/nonexistent/path/to/graph.yaml");
        assert!(result.is_err());
    }
}
