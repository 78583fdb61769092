pub mod hodgkin_huxley;
