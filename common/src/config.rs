pub mod annotation {
    /// configuration section holding one entry per rule
    pub const SECTION: &str = "annotation";

    // entry keys
    pub const KEY_ACTIVE: &str = "active";
    pub const KEY_MODULE: &str = "module";
    pub const KEY_ADDRESS: &str = "address";
    pub const KEY_CALL_ANNOTATION: &str = "callAnnotation";
    pub const KEY_INSTRUCTION_ANNOTATION: &str = "instructionAnnotation";
    pub const KEY_PARAM_COUNT: &str = "paramcount";
}

pub mod script {
    // policies which take longer than this are reported at debug level
    pub const SLOW_POLICY_MS: u128 = 50;
}

pub mod log {
    pub const PATTERN: &str = "{d(%H:%M:%S%.3f)} {h({l:<5})} {t} - {m}{n}";
}
