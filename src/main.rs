// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::process::ExitCode;

use clap::Parser;
use rhttpd::config::Config;
use rhttpd::Server;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = Config::parse();

    // SIGPIPE otherwise kills the process on the first write to a peer that
    // has already closed its end; we'd rather see a WriteZero/EPIPE error on
    // the offending connection.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let root = match rhttpd::canonical_root(&cfg.root) {
        Ok(root) => root,
        Err(err) => {
            eprintln!("rhttpd: {err}");
            return ExitCode::FAILURE;
        }
    };
    if std::env::set_current_dir(&root).is_err() {
        eprintln!(
            "rhttpd: {}",
            rhttpd::error::StartupError::Chdir(std::io::Error::last_os_error())
        );
        return ExitCode::FAILURE;
    }

    let server = match Server::new(&cfg, root.clone()) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("rhttpd: {err}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(port = cfg.port, root = %root.display(), workers = cfg.workers, "starting server");
    server.run();
}
