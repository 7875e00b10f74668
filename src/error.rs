use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// ErrMirrorStopped indicates an operation executed on a mirror after
    /// stop() has already torn it down.
    #[error("mirror stopped")]
    ErrMirrorStopped,

    /// ErrAttachCountUnderflow indicates a detach without a matching
    /// preceding attach.
    #[error("attach count underflow")]
    ErrAttachCountUnderflow,

    /// ErrBufferClosed indicates a read on a duplication buffer that has been
    /// closed and fully drained.
    #[error("duplication buffer closed")]
    ErrBufferClosed,

    /// ErrAssemblerStopped indicates a read on a frame assembler after stop().
    #[error("frame assembler stopped")]
    ErrAssemblerStopped,

    /// ErrEncodingNotFound indicates an encoding id unknown to the mirror.
    #[error("encoding {0} not found")]
    ErrEncodingNotFound(String),
}
