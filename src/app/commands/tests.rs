use super::*;

use crate::app::classifier::DefaultDeviceTypeClassifier;
use crate::app::context::Environment;
use crate::app::sharding::{ShardArgumentsBuilder, ShardPolicy};

fn base_config() -> RunConfig {
    RunConfig {
        application_id: Some("com.example.app".to_string()),
        instrumental_package: Some("com.example.app.test".to_string()),
        instrumental_runner: Some("androidx.test.runner.AndroidJUnitRunner".to_string()),
        ..RunConfig::default()
    }
}

fn context(config: RunConfig) -> TestRunnerContext {
    TestRunnerContext::new(
        "trace-cmd",
        Arc::new(config),
        Environment::new("/r".into(), "/rep".into(), "/c".into()),
    )
}

fn provider_for(devices: &[Device], registry: AnnotationCommandRegistry) -> DefaultCommandProvider {
    let shards = ShardArgumentsBuilder::new(Arc::new(DefaultDeviceTypeClassifier), ShardPolicy::Uniform)
        .build(devices, "trace-cmd")
        .expect("shards");
    DefaultCommandProvider::new(
        "sample",
        Arc::new(DefaultInstrumentationArgsProvider::new(ShardPlan::new(shards))),
        registry,
    )
}

fn labels(commands: &[DeviceCommand]) -> Vec<String> {
    commands.iter().map(DeviceCommand::label).collect()
}

#[test]
fn default_sequence_orders_setup_run_and_cleanup() {
    let apk_dir = tempfile::tempdir().expect("tmp");
    let app_apk = apk_dir.path().join("app.apk");
    std::fs::write(&app_apk, b"apk").expect("apk");
    let config = RunConfig {
        application_apk: Some(app_apk.to_string_lossy().to_string()),
        granted_permissions: vec!["android.permission.CAMERA".to_string()],
        coverage_enabled: true,
        ..base_config()
    };
    let devices = vec![Device::new("A"), Device::new("B")];
    let ctx = context(config);
    let commands = provider_for(&devices, AnnotationCommandRegistry::new())
        .provide_commands(&devices[1], &ctx)
        .expect("commands");

    assert_eq!(
        labels(&commands),
        vec![
            format!("install {}", app_apk.display()),
            "grant android.permission.CAMERA".to_string(),
            "instrument com.example.app.test/androidx.test.runner.AndroidJUnitRunner".to_string(),
            "pull /data/local/tmp/coverage.ec".to_string(),
            "uninstall com.example.app.test".to_string(),
            "uninstall com.example.app".to_string(),
        ]
    );
    let DeviceCommand::Instrument(instrument) = &commands[2] else {
        panic!("expected instrumentation command");
    };
    assert_eq!(instrument.args.get("numShards").map(String::as_str), Some("2"));
    assert_eq!(instrument.args.get("shardIndex").map(String::as_str), Some("1"));
    assert_eq!(instrument.args.get("coverage").map(String::as_str), Some("true"));
}

#[test]
fn missing_runner_is_configuration_error() {
    let config = RunConfig {
        instrumental_runner: None,
        ..base_config()
    };
    let devices = vec![Device::new("A")];
    let err = provider_for(&devices, AnnotationCommandRegistry::new())
        .provide_commands(&devices[0], &context(config))
        .unwrap_err();
    assert!(err.is_configuration());
    assert!(err.error.contains("instrumental_runner"));
}

#[test]
fn unknown_device_has_no_shard() {
    let devices = vec![Device::new("A")];
    let err = provider_for(&devices, AnnotationCommandRegistry::new())
        .provide_commands(&Device::new("Z"), &context(base_config()))
        .unwrap_err();
    assert!(err.is_configuration());
}

struct SlowTestCommands;

impl CommandsForAnnotation for SlowTestCommands {
    fn commands_for(&self, request: &CommandRequest<'_>) -> Result<Vec<DeviceCommand>, AppError> {
        Ok(vec![
            DeviceCommand::set_global_setting("stay_on_while_plugged_in", "3"),
            DeviceCommand::Instrument(request.instrumentation()),
        ])
    }
}

#[test]
fn registered_annotation_replaces_default_sequence() {
    let mut registry = AnnotationCommandRegistry::new();
    registry.register("SlowTest", Arc::new(SlowTestCommands));
    let config = RunConfig {
        annotations: vec!["com.example.annotations.SlowTest".to_string()],
        ..base_config()
    };
    let devices = vec![Device::new("A")];
    let commands = provider_for(&devices, registry)
        .provide_commands(&devices[0], &context(config))
        .expect("commands");
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0].label(), "settings stay_on_while_plugged_in=3");
    let DeviceCommand::Instrument(instrument) = &commands[1] else {
        panic!("expected instrumentation command");
    };
    assert_eq!(
        instrument.args.get("annotation").map(String::as_str),
        Some("com.example.annotations.SlowTest")
    );
}

#[test]
fn unmatched_annotation_keeps_default_sequence() {
    let mut registry = AnnotationCommandRegistry::new();
    registry.register("SlowTest", Arc::new(SlowTestCommands));
    let config = RunConfig {
        annotations: vec!["com.example.SmokeTest".to_string()],
        uninstall_after_run: false,
        ..base_config()
    };
    let devices = vec![Device::new("A")];
    let commands = provider_for(&devices, registry)
        .provide_commands(&devices[0], &context(config))
        .expect("commands");
    assert_eq!(commands.len(), 1);
    assert!(matches!(commands[0], DeviceCommand::Instrument(_)));
}

#[test]
fn missing_apk_fails_validation() {
    let config = RunConfig {
        test_apk: Some("/no/such/test.apk".to_string()),
        ..base_config()
    };
    let devices = vec![Device::new("A")];
    let err = provider_for(&devices, AnnotationCommandRegistry::new())
        .provide_commands(&devices[0], &context(config))
        .unwrap_err();
    assert!(err.error.contains("APK not found"));
}

#[test]
fn instrument_args_are_shell_quoted() {
    let mut args = BTreeMap::new();
    args.insert("class".to_string(), "com.example.A#b".to_string());
    args.insert("size".to_string(), "large".to_string());
    let command = InstrumentationCommand {
        test_package: "com.example.test".to_string(),
        runner: "androidx.test.runner.AndroidJUnitRunner".to_string(),
        args,
    };
    assert_eq!(
        command.to_args(),
        vec![
            "shell", "am", "instrument", "-r", "-w", "-e", "class", "'com.example.A#b'", "-e",
            "size", "large", "com.example.test/androidx.test.runner.AndroidJUnitRunner",
        ]
    );
    assert_eq!(shell_quote("it's"), r"'it'\''s'");
}

#[test]
fn pull_resolves_to_given_target() {
    let pull = DeviceCommand::Pull {
        remote_path: "/sdcard/coverage.ec".to_string(),
        dest: ArtifactDir::Coverage,
        name: COVERAGE_FILE_NAME.to_string(),
    };
    assert_eq!(
        pull.bridge_args(Some(Path::new("/c/A/coverage.ec"))),
        vec!["pull", "/sdcard/coverage.ec", "/c/A/coverage.ec"]
    );
    let escaping = DeviceCommand::Pull {
        remote_path: "/sdcard/x".to_string(),
        dest: ArtifactDir::Results,
        name: "../../etc".to_string(),
    };
    assert!(escaping.validate("t").unwrap_err().is_configuration());
}
