use taskscope_macros::task_scoped;

struct Handler;

impl Handler {
    // the receiver cannot be a context object
    #[task_scoped]
    fn handle(#[task_context] &self) {}
}

fn main() {}
