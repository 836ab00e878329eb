// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Redirecting the wrapped tool into the proxy.
//!
//! Done once when the proxy starts, via environment only — the CLI host
//! applies the returned variables when it spawns the tool:
//!
//! - **Node-runtime tools** (claude): a small require-hook patches
//!   `fetch` and the `http`/`https` client entry points so any URL under
//!   the upstream origin is rewritten to the proxy origin; injected with
//!   `NODE_OPTIONS=--require`.
//! - **Static binaries** (codex): the standard proxy variables, upper- and
//!   lower-case, pointed at the loopback listener.

use std::path::PathBuf;

use anyhow::Context;

use crate::upstream::ToolKind;

/// Environment for the CLI host to apply when spawning the tool.
pub fn redirect_env(
    kind: ToolKind,
    upstream: &str,
    proxy_origin: &str,
) -> anyhow::Result<Vec<(String, String)>> {
    match kind {
        ToolKind::Claude => {
            let hook = write_require_hook(upstream, proxy_origin)?;
            Ok(vec![(
                "NODE_OPTIONS".to_string(),
                format!("--require {}", hook.display()),
            )])
        }
        ToolKind::Codex => Ok(vec![
            ("HTTP_PROXY".to_string(), proxy_origin.to_string()),
            ("HTTPS_PROXY".to_string(), proxy_origin.to_string()),
            ("http_proxy".to_string(), proxy_origin.to_string()),
            ("https_proxy".to_string(), proxy_origin.to_string()),
        ]),
    }
}

/// Write the require-hook script and return its path.
fn write_require_hook(upstream: &str, proxy_origin: &str) -> anyhow::Result<PathBuf> {
    let dir = std::env::temp_dir();
    let path = dir.join(format!("ferry-redirect-{}.js", std::process::id()));
    let script = require_hook_script(upstream, proxy_origin);
    std::fs::write(&path, script)
        .with_context(|| format!("writing require hook {}", path.display()))?;
    Ok(path)
}

fn require_hook_script(upstream: &str, proxy_origin: &str) -> String {
    // JSON-escape the two origins so quotes/backslashes cannot break out.
    let upstream = serde_json::to_string(upstream).unwrap_or_else(|_| "\"\"".into());
    let proxy = serde_json::to_string(proxy_origin).unwrap_or_else(|_| "\"\"".into());
    format!(
        r#"// Generated by ferry; rewrites upstream API calls to the local proxy.
'use strict';
const UPSTREAM = {upstream};
const PROXY = {proxy};
const rewrite = (u) => (typeof u === 'string' && u.startsWith(UPSTREAM))
  ? PROXY + u.slice(UPSTREAM.length)
  : u;

if (typeof globalThis.fetch === 'function') {{
  const origFetch = globalThis.fetch;
  globalThis.fetch = function (input, init) {{
    if (typeof input === 'string') return origFetch(rewrite(input), init);
    if (input && typeof input.url === 'string' && input.url.startsWith(UPSTREAM)) {{
      return origFetch(new Request(rewrite(input.url), input), init);
    }}
    return origFetch(input, init);
  }};
}}

const http = require('http');
const https = require('https');
const {{ URL }} = require('url');
for (const mod of [http, https]) {{
  for (const name of ['request', 'get']) {{
    const orig = mod[name].bind(mod);
    mod[name] = function (arg, options, cb) {{
      if (typeof arg === 'string') arg = rewrite(arg);
      else if (arg instanceof URL && arg.href.startsWith(UPSTREAM)) {{
        arg = new URL(rewrite(arg.href));
      }}
      // The proxy listens on plain http; hand rewritten https calls over.
      if (mod === https && typeof arg === 'string' && arg.startsWith('http://')) {{
        return http.request(arg, options, cb);
      }}
      return orig(arg, options, cb);
    }};
  }}
}}
"#
    )
}

// ── Unit tests ────────────────────────────────────────────────────────────────
