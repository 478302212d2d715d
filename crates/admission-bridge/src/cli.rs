use clap::builder::PossibleValue;
use clap::{crate_authors, crate_description, crate_name, crate_version, Arg, ArgAction, Command};

pub fn build_cli() -> Command {
    let mut args = vec![
        Arg::new("log-level")
            .long("log-level")
            .value_name("LOG_LEVEL")
            .env("ADMISSION_BRIDGE_LOG_LEVEL")
            .default_value("info")
            .value_parser([
                PossibleValue::new("trace"),
                PossibleValue::new("debug"),
                PossibleValue::new("info"),
                PossibleValue::new("warn"),
                PossibleValue::new("error"),
            ])
            .help("Log level"),
        Arg::new("log-fmt")
            .long("log-fmt")
            .value_name("LOG_FMT")
            .env("ADMISSION_BRIDGE_LOG_FMT")
            .default_value("text")
            .value_parser([PossibleValue::new("text"), PossibleValue::new("json")])
            .help("Log output format"),
        Arg::new("log-no-color")
            .long("log-no-color")
            .env("NO_COLOR")
            .action(ArgAction::SetTrue)
            .help("Disable colored output for logs"),
        Arg::new("address")
            .long("addr")
            .value_name("BIND_ADDRESS")
            .default_value("0.0.0.0")
            .env("ADMISSION_BRIDGE_BIND_ADDRESS")
            .help("Bind against ADDRESS"),
        Arg::new("port")
            .long("port")
            .value_name("PORT")
            .default_value("8443")
            .env("ADMISSION_BRIDGE_PORT")
            .help("Listen on PORT"),
        Arg::new("cert-file")
            .long("cert-file")
            .value_name("CERT_FILE")
            .default_value("")
            .env("ADMISSION_BRIDGE_CERT_FILE")
            .help("Path to an X.509 certificate file for HTTPS"),
        Arg::new("key-file")
            .long("key-file")
            .value_name("KEY_FILE")
            .default_value("")
            .env("ADMISSION_BRIDGE_KEY_FILE")
            .help("Path to an X.509 private key file for HTTPS"),
        Arg::new("validate-topic")
            .long("validate-topic")
            .value_name("TOPIC")
            .env("FUNCTION_TOPIC")
            .default_value("validate")
            .help("Message bus topic of the validating decision function"),
        Arg::new("mutate-topic")
            .long("mutate-topic")
            .value_name("TOPIC")
            .env("MUTATE_FUNCTION_TOPIC")
            .default_value("mutate")
            .help("Message bus topic of the mutating decision function"),
        Arg::new("dispatch-attempt-timeout-ms")
            .long("dispatch-attempt-timeout-ms")
            .value_name("MILLISECONDS")
            .env("ADMISSION_BRIDGE_DISPATCH_ATTEMPT_TIMEOUT_MS")
            .default_value("1000")
            .help("How long to wait for a decision before publishing the request again"),
        Arg::new("dispatch-max-attempts")
            .long("dispatch-max-attempts")
            .value_name("ATTEMPTS")
            .env("ADMISSION_BRIDGE_DISPATCH_MAX_ATTEMPTS")
            .default_value("3")
            .help("Number of times a request is published before giving up"),
        Arg::new("bus-queue-size")
            .long("bus-queue-size")
            .value_name("SIZE")
            .env("ADMISSION_BRIDGE_BUS_QUEUE_SIZE")
            .default_value("64")
            .help("Maximum number of invocations waiting to be served by the decision functions"),
        Arg::new("workers")
            .long("workers")
            .value_name("WORKERS_NUMBER")
            .env("ADMISSION_BRIDGE_WORKERS")
            .help("Number of decision function evaluations running at the same time, defaults to the number of CPUs"),
        Arg::new("resource-policy")
            .long("resource-policy")
            .value_name("RESOURCE_POLICY_FILE")
            .env("ADMISSION_BRIDGE_RESOURCE_POLICY")
            .help("YAML file holding the default resources set on Deployment containers"),
        Arg::new("sidecar-config")
            .long("sidecar-config")
            .value_name("SIDECAR_CONFIG_FILE")
            .env("ADMISSION_BRIDGE_SIDECAR_CONFIG")
            .help("YAML file holding the volumes and volume mounts injected into Pods"),
        Arg::new("label-policy")
            .long("label-policy")
            .value_name("LABEL_POLICY_FILE")
            .env("ADMISSION_BRIDGE_LABEL_POLICY")
            .help("YAML file holding the labels required on workloads and services"),
    ];
    args.sort_by(|a, b| a.get_id().cmp(b.get_id()));

    Command::new(crate_name!())
        .author(crate_authors!())
        .version(crate_version!())
        .about(crate_description!())
        .args(args)
}
