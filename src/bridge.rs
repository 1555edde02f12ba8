//! Generated guest-side bridge scripts.
//!
//! Everything a guest can reach beyond its own source is wired through these
//! generated shims: the CommonJS `require` over the uploaded dependency map,
//! the `net`/`fetch` surface over the virtual network binding, the platform
//! attachment for JS, dependency installation for Python, and the zero-arg
//! trampolines that carry a literalized event into Python and Ruby handlers.
//!
//! Host bindings referenced here (`__faas_net_http`, `__faas_kv`,
//! `__faas_sql`) are registered on the context before the script runs; the
//! engine exposes them as top-level guest names.

use crate::constants::{
    KV_BINDING, NET_BINDING, PLATFORM_ATTACH_NAME, SQL_BINDING, TRAMPOLINE_NAME,
};
use crate::engine::{to_python_literal, to_ruby_literal};
use serde_json::Value;
use std::collections::BTreeMap;

// =============================================================================
// JavaScript
// =============================================================================

/// Installs `globalThis.require` over an embedded module map.
///
/// CommonJS semantics: each module body runs once inside an
/// `(exports, module, require)` wrapper, the module cache is primed before
/// the body runs so cycles resolve, and unknown names throw
/// `Module not found: <name>`.
pub fn js_require_installer(dependencies: &BTreeMap<String, String>) -> String {
    let mut entries = String::new();
    for (name, source) in dependencies {
        entries.push_str(&format!(
            "    {}: function (exports, module, require) {{\n{}\n    }},\n",
            js_string(name),
            source
        ));
    }

    format!(
        r#"(function () {{
  var modules = {{
{entries}  }};
  var cache = {{}};
  globalThis.require = function (name) {{
    if (!Object.prototype.hasOwnProperty.call(modules, name)) {{
      throw new Error('Module not found: ' + name);
    }}
    if (Object.prototype.hasOwnProperty.call(cache, name)) {{
      return cache[name].exports;
    }}
    var module = {{ exports: {{}} }};
    cache[name] = module;
    modules[name](module.exports, module, globalThis.require);
    return module.exports;
  }};
}})();
"#
    )
}

/// Installs `globalThis.net` and a `fetch` façade over the network binding.
pub fn js_net_shim() -> String {
    format!(
        r#"(function () {{
  var hostHttp = {NET_BINDING};
  var net = {{
    http: function (method, url, body, headers) {{
      return hostHttp(method, url, body == null ? null : String(body), headers || {{}});
    }},
    get: function (url, headers) {{ return net.http('GET', url, null, headers); }},
    post: function (url, body, headers) {{ return net.http('POST', url, body, headers); }}
  }};
  globalThis.net = net;
  globalThis.fetch = function (input, init) {{
    init = init || {{}};
    var res;
    try {{
      res = net.http(init.method || 'GET', String(input), init.body == null ? null : String(init.body), init.headers || {{}});
    }} catch (e) {{
      return Promise.reject(e);
    }}
    var lower = {{}};
    for (var name in res.headers) {{
      lower[name.toLowerCase()] = res.headers[name];
    }}
    return Promise.resolve({{
      ok: res.status >= 200 && res.status < 300,
      status: res.status,
      url: String(input),
      headers: {{
        get: function (name) {{
          var v = lower[String(name).toLowerCase()];
          return v === undefined ? null : v;
        }},
        has: function (name) {{ return lower[String(name).toLowerCase()] !== undefined; }}
      }},
      text: function () {{ return Promise.resolve(res.body); }},
      json: function () {{
        try {{
          return Promise.resolve(JSON.parse(res.body));
        }} catch (e) {{
          return Promise.reject(e);
        }}
      }}
    }});
  }};
}})();
"#
    )
}

/// Installs the helper that attaches the platform proxy to an event object.
///
/// `with_sql` controls whether a rejecting `platform.sql` surface appears
/// next to `platform.kv`.
pub fn js_platform_attach(with_kv: bool, with_sql: bool) -> String {
    let kv = if with_kv {
        format!(
            r#"    platform.kv = {{
      get: function (key) {{ return {KV_BINDING}('get', String(key), null); }},
      put: function (key, value) {{ return {KV_BINDING}('put', String(key), value); }},
      delete: function (key) {{ return {KV_BINDING}('delete', String(key), null); }}
    }};
"#
        )
    } else {
        String::new()
    };
    let sql = if with_sql {
        format!(
            r#"    platform.sql = {{
      query: function (statement) {{ return {SQL_BINDING}(String(statement)); }}
    }};
"#
        )
    } else {
        String::new()
    };

    format!(
        r#"(function () {{
  globalThis.{PLATFORM_ATTACH_NAME} = function (event) {{
    var platform = {{}};
{kv}{sql}    event.platform = platform;
    return event;
  }};
}})();
"#
    )
}

// =============================================================================
// Python
// =============================================================================

/// Installs each dependency as an importable module: an ephemeral module
/// object whose dict the dependency source is executed into, registered so
/// `import name` resolves.
pub fn python_dependency_installer(dependencies: &BTreeMap<String, String>) -> String {
    if dependencies.is_empty() {
        return String::new();
    }
    let mut script = String::from("import sys, types\n");
    for (name, source) in dependencies {
        let name_literal = to_python_literal(&Value::String(name.clone()));
        let source_literal = to_python_literal(&Value::String(source.clone()));
        script.push_str(&format!(
            "_faas_module = types.ModuleType({name_literal})\n\
             exec(compile({source_literal}, {name_literal}, 'exec'), _faas_module.__dict__)\n\
             sys.modules[{name_literal}] = _faas_module\n"
        ));
    }
    script.push_str("del _faas_module\n");
    script
}

/// `net` object forwarding to the network binding.
pub fn python_net_shim() -> String {
    format!(
        r#"class _FaasNet(object):
    def http(self, method, url, body=None, headers=None):
        return {NET_BINDING}(method, url, body, headers or {{}})

    def get(self, url, headers=None):
        return self.http('GET', url, None, headers)

    def post(self, url, body=None, headers=None):
        return self.http('POST', url, body, headers)

net = _FaasNet()
"#
    )
}

/// Zero-argument trampoline calling the handler with the baked event literal.
pub fn python_trampoline(function_name: &str, event: &Value) -> String {
    let literal = to_python_literal(event);
    format!("def {TRAMPOLINE_NAME}():\n    return {function_name}({literal})\n")
}

// =============================================================================
// Ruby
// =============================================================================

/// `$net` singleton plus a top-level `net` method.
pub fn ruby_net_shim() -> String {
    format!(
        r#"class FaasNet
  def http(method, url, body = nil, headers = nil)
    {NET_BINDING}(method, url, body, headers || {{}})
  end

  def get(url, headers = nil)
    http('GET', url, nil, headers)
  end

  def post(url, body = nil, headers = nil)
    http('POST', url, body, headers)
  end
end

$net = FaasNet.new

def net
  $net
end
"#
    )
}

/// Lambda trampoline bound to a global, mirroring the Python shape.
pub fn ruby_trampoline(function_name: &str, event: &Value) -> String {
    let literal = to_ruby_literal(event);
    format!("${TRAMPOLINE_NAME} = lambda do\n  {function_name}({literal})\nend\n")
}

/// Name the Ruby trampoline is looked up under.
pub fn ruby_trampoline_global() -> String {
    format!("${TRAMPOLINE_NAME}")
}

fn js_string(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string())
}
