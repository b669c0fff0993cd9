use crate::{Cmd, CmdExpr};

#[test]
fn display_simple() {
    let cmd = Cmd::new("printf").arg("%s").arg("a b");
    assert_eq!(cmd.to_string(), "printf '%s' 'a b'");
}

#[test]
fn display_plain_args_unquoted() {
    let cmd = Cmd::new("ls").arg("-l").arg("/tmp");
    assert_eq!(cmd.to_string(), "ls -l /tmp");
}

#[test]
fn display_env_prefix() {
    let cmd = Cmd::new("env").env("PROCPIPE_TEST_VAR", "value");
    let shown = cmd.to_string();
    assert!(shown.starts_with("PROCPIPE_TEST_VAR=value "), "{}", shown);
    assert!(shown.ends_with("env"), "{}", shown);
}

#[test]
fn display_pipe() {
    let expr = Cmd::new("cat") | Cmd::new("wc").arg("-l");
    assert_eq!(expr.to_string(), "cat | wc -l");
}

#[test]
fn display_err_pipe_and_seq() {
    let expr = Cmd::new("a").pipe_err(Cmd::new("b"));
    assert_eq!(expr.to_string(), "a .| b");
    let expr = Cmd::new("a") & Cmd::new("b");
    assert_eq!(expr.to_string(), "a & b");
}

#[test]
fn operators_nest_left() {
    let expr = Cmd::new("a") | Cmd::new("b") | Cmd::new("c");
    match expr {
        CmdExpr::Pipe(left, right) => {
            assert!(matches!(*left, CmdExpr::Pipe(..)));
            assert!(matches!(*right, CmdExpr::Single(..)));
        }
        other => panic!("unexpected shape: {:?}", other),
    }
}

#[test]
fn env_remove_after_set() {
    let cmd = Cmd::new("env")
        .env("PROCPIPE_A", "1")
        .env("PROCPIPE_B", "2")
        .env_remove("PROCPIPE_A");
    let shown = cmd.to_string();
    assert!(!shown.contains("PROCPIPE_A"), "{}", shown);
    assert!(shown.contains("PROCPIPE_B=2"), "{}", shown);
}

#[test]
fn last_env_setting_wins() {
    use std::ffi::OsString;

    let cmd = Cmd::new("env")
        .env("PROCPIPE_DUP", "first")
        .env("PROCPIPE_DUP", "second");
    let env = cmd.format_env().unwrap();
    assert!(env.contains(&OsString::from("PROCPIPE_DUP=second")));
    assert!(!env.contains(&OsString::from("PROCPIPE_DUP=first")));
}

#[test]
fn ignore_status_flag() {
    assert!(!Cmd::new("false").ignores_status());
    assert!(Cmd::new("false").ignore_status().ignores_status());
}
