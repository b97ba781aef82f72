//! Annotated settings template printed by `saber example-settings`.

pub const EXAMPLE_SETTINGS: &str = r#"# saber settings
#
# Global keys apply to every server unless the server table overrides them.

ga_path = "/absolute/path/to/workflow.ga"   # workflow under test (.ga)
maxwait = 12000                             # upload budget, seconds
interval = 5                                # seconds between upload state checks
timeout = 1200                              # execution budget, seconds
sleep_time = 5                              # seconds between job state checks
clean_history = "onsuccess"                 # never | always | onsuccess | successful_only
history_name = "SABER"
delete_after = 5                            # purge leftover test histories older than this (days)
date_string = false                         # true stamps reports with the run date, or set a label

[data_inputs.label_example_name]            # key must match the workflow input label
url = "https://example.org/change_me.fastq"
file_type = "fastqsanger"

[[servers]]
name = "Main"
url = "https://usegalaxy.example"
api = "YOUR_API_KEY"                        # used first when present
# email = "user@example.com"
# password = "password"
default_compute_id = "None"                 # compute id of the local (Default) endpoint
endpoints = [
    "changeme",
    { name = "changeme-slow", timeout = 3600, sleep_time = 30 },
]
"#;
