use std::{io::Write, process::Command};

use logpipe::{CancellationToken, LogPipe, stderr_func, stdout_func};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn main() -> Result<(), BoxError> {
    let mut pipe = LogPipe::new().with_tag("demo");
    let child_stdout = pipe.add_tagged("sh:stdout", stdout_func())?;
    let child_stderr = pipe.add_tagged("sh:stderr", stderr_func())?;
    // this process writes into the pipe too
    let mut own = pipe.add(stdout_func())?;

    let mut child = Command::new("sh")
        .arg("-c")
        .arg("for i in 1 2 3; do echo \"step $i\"; echo \"warning $i\" >&2; done")
        .stdout(child_stdout.into_stdio()?)
        .stderr(child_stderr.into_stdio()?)
        .spawn()?;

    std::thread::scope(|s| {
        let run = s.spawn(|| pipe.run(&CancellationToken::new()));
        writeln!(own, "child spawned with pid {}", child.id())?;
        let status = child.wait()?;
        writeln!(own, "child exited with {status}")?;
        drop(own);
        run.join().expect("log pipe thread panicked")?;
        Ok::<(), BoxError>(())
    })
}
