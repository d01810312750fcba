use hookvm::{Cpu, Register, State};

#[test]
fn test_save_and_load_state_file() {
    let mut cpu = Cpu::new(0);
    cpu.set_reg(Register::RIP, 0xfffff805_1a2b_3c4d);
    cpu.set_reg(Register::RSP, 0xffff_a000_0001_0000);
    cpu.set_reg(Register::CR3, 0x1ad000);
    cpu.state_mut().zmm[0].q = [1, 2, 3, 4, 5, 6, 7, u64::MAX];
    cpu.state_mut().fpst[7] = 0x8000_0000_0000_0000;

    let path = std::env::temp_dir().join(format!("hookvm-state-{}.toml", std::process::id()));
    cpu.state().save_to_file(&path).unwrap();
    let loaded = State::load_from_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(&loaded, cpu.state());

    let mut other = Cpu::new(1);
    other.set_state(loaded);
    assert_eq!(other.reg(Register::RIP), 0xfffff805_1a2b_3c4d);
}

#[test]
fn test_load_missing_file_reports_path() {
    let err = State::load_from_file("/nonexistent/hookvm/state.toml").unwrap_err();
    assert!(err.to_string().contains("state.toml"));
}

#[test]
fn test_bad_hex_is_rejected() {
    let toml_str = State::new()
        .to_toml_string()
        .unwrap()
        .replacen("rip = \"0x0\"", "rip = \"0xnothex\"", 1);
    assert!(State::from_toml_str(&toml_str).is_err());
}
