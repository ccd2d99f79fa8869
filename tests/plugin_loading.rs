use std::fs;
use std::path::Path;

use plugin_sandbox::config::SandboxConfig;
use plugin_sandbox::core::logger::LogLevel;
use plugin_sandbox::testing::{capture_output, try_plugin};
use plugin_sandbox::{AllowList, CapabilityKind, LoadError, PluginHost, PluginLoader};
use tempfile::TempDir;

fn write_plugin(root: &Path, dir: &str, source: &str) {
    let dir = root.join(dir);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("plugin.lua"), source).unwrap();
}

fn host(allow: &[&str]) -> PluginHost {
    let config = SandboxConfig {
        allow_list: AllowList::new(allow.iter().copied()),
        ..SandboxConfig::default()
    };
    PluginHost::new(&config).unwrap()
}

#[test]
fn test_load_all_over_a_plugin_tree() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    write_plugin(root, "weather", "NAME = 'Weather'\nAUTHOR = 'Akaere'\n");
    write_plugin(root, "nested/geo", "local m = require('math')\nNAME = 'Geo ' .. m.abs(-3)\n");
    write_plugin(root, "thief", "local f = io.open('/etc/hostname')\nNAME = 'Thief'\n");
    write_plugin(root, "shell", "local os = require('os')\nNAME = 'Shell'\n");

    let host = host(&["math"]);
    let (plugins, output) = capture_output(|| {
        PluginLoader::new(&host)
            .verbose(false)
            .load_all(root, "plugin.lua")
            .unwrap()
    });

    let mut infos: Vec<String> = plugins.iter().map(|p| p.metadata.info()).collect();
    infos.sort();
    assert_eq!(infos, vec!["Geo 3 by ", "Weather by Akaere"]);
    assert_eq!(output.count(LogLevel::Error), 2);
    assert!(output.contains("Loaded 2 plugin(s), skipped 2"));
    assert!(!host.capabilities().is_intercepted());
}

#[test]
fn test_loaded_plugin_can_be_invoked_under_the_same_rules() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("greeter.lua");
    fs::write(
        &path,
        "NAME = 'Greeter'\n\
         function greet(who) return 'hello ' .. who end\n\
         function escape() return load('return 1')() end\n",
    )
    .unwrap();

    let host = host(&[]);
    let (metadata, output) = try_plugin(&host, &path);
    assert_eq!(metadata.unwrap().name, "Greeter");
    assert!(output.stderr().is_empty());

    let plugin = PluginLoader::new(&host).load_plugin(&path).unwrap();
    let greeting: String = host.invoke(&plugin.unit, "greet", "world").unwrap();
    assert_eq!(greeting, "hello world");

    let err = host.invoke::<i64>(&plugin.unit, "escape", ()).unwrap_err();
    match err {
        LoadError::Denied(denied) => assert_eq!(denied.kind, CapabilityKind::DynamicEval),
        other => panic!("expected a denial, got {:?}", other),
    }
}

#[test]
fn test_metadata_serializes_for_json_output() {
    let temp_dir = TempDir::new().unwrap();
    write_plugin(temp_dir.path(), "json", "NAME = ' Json '\nAUTHOR = 42\n");

    let host = host(&[]);
    let (plugins, _) = capture_output(|| {
        PluginLoader::new(&host)
            .load_all(temp_dir.path(), "plugin.lua")
            .unwrap()
    });
    let metadata: Vec<_> = plugins.iter().map(|p| &p.metadata).collect();

    let json = serde_json::to_value(&metadata).unwrap();
    assert_eq!(json, serde_json::json!([{ "name": "Json", "author": "42" }]));
}
